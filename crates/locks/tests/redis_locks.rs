// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Dibs Contributors
//
// This file is part of Dibs.
//
// Dibs is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// Dibs is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with Dibs. If not, see <https://www.gnu.org/licenses/>.

//! Redis lock backend integration tests.
//!
//! Requires a running Redis server (default `redis://localhost:6379`,
//! override with `DIBS_TEST_REDIS_URL`). Run with:
//!
//! ```bash
//! cargo test -p dibs-locks --test redis_locks -- --ignored
//! ```
//!
//! Each test uses a unique namespace so runs never collide.

#[cfg(feature = "redis-backend")]
mod tests {
    use dibs_locks::{LockBackend, LockKey, RedisLockBackend};
    use std::sync::Arc;
    use tokio::time::{sleep, Duration};
    use ulid::Ulid;

    /// Connect to the test Redis server under a unique namespace.
    async fn create_backend() -> RedisLockBackend {
        let url = std::env::var("DIBS_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let namespace = format!("dibs-test-{}", Ulid::new());
        RedisLockBackend::connect(&url, &namespace).await.unwrap()
    }

    fn key(opportunity: &str) -> LockKey {
        LockKey::new("upwork", opportunity)
    }

    #[tokio::test]
    #[ignore] // Requires Redis server
    async fn test_redis_acquire_and_get() {
        let backend = create_backend().await;

        let acquired = backend
            .try_acquire(&key("job-1"), "worker-1", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(acquired);

        let lease = backend.get(&key("job-1")).await.unwrap().unwrap();
        assert_eq!(lease.key, "upwork#job-1");
        assert_eq!(lease.holder_id, "worker-1");
        assert!(!lease.is_expired());
        assert!(lease.remaining() <= Duration::from_secs(30));
    }

    #[tokio::test]
    #[ignore] // Requires Redis server
    async fn test_redis_conflict_while_held() {
        let backend = create_backend().await;

        assert!(backend
            .try_acquire(&key("job-1"), "worker-1", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(!backend
            .try_acquire(&key("job-1"), "worker-2", Duration::from_secs(30))
            .await
            .unwrap());

        let lease = backend.get(&key("job-1")).await.unwrap().unwrap();
        assert_eq!(lease.holder_id, "worker-1");
    }

    #[tokio::test]
    #[ignore] // Requires Redis server
    async fn test_redis_lease_expires_at_ttl() {
        let backend = create_backend().await;

        assert!(backend
            .try_acquire(&key("job-1"), "worker-1", Duration::from_secs(1))
            .await
            .unwrap());

        sleep(Duration::from_millis(1100)).await;

        assert!(backend.get(&key("job-1")).await.unwrap().is_none());
        assert!(backend
            .try_acquire(&key("job-1"), "worker-2", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires Redis server
    async fn test_redis_release_requires_holder() {
        let backend = create_backend().await;

        assert!(backend
            .try_acquire(&key("job-1"), "worker-1", Duration::from_secs(30))
            .await
            .unwrap());

        // The compare-and-delete script must refuse a non-holder.
        assert!(!backend.release(&key("job-1"), "worker-2").await.unwrap());
        assert!(backend.get(&key("job-1")).await.unwrap().is_some());

        assert!(backend.release(&key("job-1"), "worker-1").await.unwrap());
        assert!(backend.get(&key("job-1")).await.unwrap().is_none());
        assert!(!backend.release(&key("job-1"), "worker-1").await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires Redis server
    async fn test_redis_concurrent_acquisition_single_winner() {
        let backend = Arc::new(create_backend().await);
        let mut handles = vec![];

        for i in 0..10 {
            let backend_clone = backend.clone();
            handles.push(tokio::spawn(async move {
                backend_clone
                    .try_acquire(
                        &LockKey::new("upwork", "contended-job"),
                        &format!("worker-{}", i),
                        Duration::from_secs(30),
                    )
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "exactly one task should win the lease");
    }

    #[tokio::test]
    #[ignore] // Requires Redis server
    async fn test_redis_namespace_isolation() {
        let backend_a = create_backend().await;
        let backend_b = create_backend().await;

        // Same logical key under different namespaces never contends.
        assert!(backend_a
            .try_acquire(&key("job-1"), "worker-a", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(backend_b
            .try_acquire(&key("job-1"), "worker-b", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires Redis server
    async fn test_redis_health_check() {
        let backend = create_backend().await;
        assert!(backend.health_check().await);
    }

    #[tokio::test]
    #[ignore] // Requires Redis server
    async fn test_redis_retrying_acquire_outlasts_short_lease() {
        let backend = create_backend().await;

        assert!(backend
            .try_acquire(&key("job-1"), "worker-1", Duration::from_millis(300))
            .await
            .unwrap());

        let acquired = backend
            .acquire(
                &key("job-1"),
                "worker-2",
                Duration::from_secs(30),
                Duration::from_secs(3),
            )
            .await;
        assert!(acquired);
    }
}
