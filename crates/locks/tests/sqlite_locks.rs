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

//! SQLite lock backend integration tests.
//!
//! These tests verify:
//! - Lease acquisition, conflict, release, and holder isolation
//! - TTL expiry as the crash-recovery path (no release required)
//! - Exactly-one-winner behavior under concurrent acquisition
//! - Acquisition counters

#[cfg(feature = "sqlite-backend")]
mod tests {
    use dibs_locks::{LockBackend, LockKey, SqliteLockBackend};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::time::{sleep, Duration};

    /// Create a file-backed lock store in a fresh temp directory.
    ///
    /// File-backed rather than `sqlite::memory:`: every pooled
    /// connection must see the same leases table.
    async fn create_backend(dir: &TempDir) -> SqliteLockBackend {
        let path = dir.path().join("leases.db");
        SqliteLockBackend::new(&format!("sqlite:{}?mode=rwc", path.display()))
            .await
            .unwrap()
    }

    fn key(opportunity: &str) -> LockKey {
        LockKey::new("upwork", opportunity)
    }

    #[tokio::test]
    async fn test_sqlite_acquire_and_get() {
        let dir = TempDir::new().unwrap();
        let backend = create_backend(&dir).await;

        let acquired = backend
            .try_acquire(&key("job-1"), "worker-1", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(acquired);

        let lease = backend.get(&key("job-1")).await.unwrap().unwrap();
        assert_eq!(lease.key, "upwork#job-1");
        assert_eq!(lease.holder_id, "worker-1");
        assert!(lease.acquired_at.is_some());
        assert!(!lease.is_expired());
    }

    #[tokio::test]
    async fn test_sqlite_conflict_while_held() {
        let dir = TempDir::new().unwrap();
        let backend = create_backend(&dir).await;

        assert!(backend
            .try_acquire(&key("job-1"), "worker-1", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(!backend
            .try_acquire(&key("job-1"), "worker-2", Duration::from_secs(30))
            .await
            .unwrap());

        // The losing attempt must not disturb the winner's lease.
        let lease = backend.get(&key("job-1")).await.unwrap().unwrap();
        assert_eq!(lease.holder_id, "worker-1");
    }

    #[tokio::test]
    async fn test_sqlite_lease_expires_at_ttl() {
        let dir = TempDir::new().unwrap();
        let backend = create_backend(&dir).await;

        // 1s lease, never released: simulates a crashed worker.
        assert!(backend
            .try_acquire(&key("job-1"), "worker-1", Duration::from_secs(1))
            .await
            .unwrap());
        assert!(!backend
            .try_acquire(&key("job-1"), "worker-2", Duration::from_secs(30))
            .await
            .unwrap());

        // Just past the TTL the key must be acquirable again.
        sleep(Duration::from_millis(1100)).await;
        assert!(backend.get(&key("job-1")).await.unwrap().is_none());
        assert!(backend
            .try_acquire(&key("job-1"), "worker-2", Duration::from_secs(30))
            .await
            .unwrap());

        let lease = backend.get(&key("job-1")).await.unwrap().unwrap();
        assert_eq!(lease.holder_id, "worker-2");
    }

    #[tokio::test]
    async fn test_sqlite_release_requires_holder() {
        let dir = TempDir::new().unwrap();
        let backend = create_backend(&dir).await;

        assert!(backend
            .try_acquire(&key("job-1"), "worker-1", Duration::from_secs(30))
            .await
            .unwrap());

        // A non-holder cannot release someone else's lease.
        assert!(!backend.release(&key("job-1"), "worker-2").await.unwrap());
        assert!(backend.get(&key("job-1")).await.unwrap().is_some());

        assert!(backend.release(&key("job-1"), "worker-1").await.unwrap());
        assert!(backend.get(&key("job-1")).await.unwrap().is_none());

        // Releasing an already-released lease reports false.
        assert!(!backend.release(&key("job-1"), "worker-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_concurrent_acquisition_single_winner() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(create_backend(&dir).await);
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

        let snap = backend.metrics().snapshot();
        assert_eq!(snap.attempts, 10);
        assert_eq!(snap.successes, 1);
        assert_eq!(snap.conflicts, 9);
    }

    #[tokio::test]
    async fn test_sqlite_retrying_acquire_outlasts_short_lease() {
        let dir = TempDir::new().unwrap();
        let backend = create_backend(&dir).await;

        assert!(backend
            .try_acquire(&key("job-1"), "worker-1", Duration::from_millis(300))
            .await
            .unwrap());

        // The retry loop should win shortly after the 300ms lease lapses.
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

    #[tokio::test]
    async fn test_sqlite_retrying_acquire_times_out() {
        let dir = TempDir::new().unwrap();
        let backend = create_backend(&dir).await;

        assert!(backend
            .try_acquire(&key("job-1"), "worker-1", Duration::from_secs(30))
            .await
            .unwrap());

        let acquired = backend
            .acquire(
                &key("job-1"),
                "worker-2",
                Duration::from_secs(30),
                Duration::from_millis(200),
            )
            .await;
        assert!(!acquired);

        let snap = backend.metrics().snapshot();
        assert_eq!(snap.timeouts, 1);
        assert!(snap.conflicts >= 2, "the loop should have retried");
    }

    #[tokio::test]
    async fn test_sqlite_reap_makes_room_for_new_leases() {
        let dir = TempDir::new().unwrap();
        let backend = create_backend(&dir).await;

        // Fill a few keys with short leases.
        for i in 0..5 {
            assert!(backend
                .try_acquire(&key(&format!("job-{}", i)), "worker-1", Duration::from_millis(100))
                .await
                .unwrap());
        }
        sleep(Duration::from_millis(150)).await;

        // Any new acquire reaps the lapsed rows and succeeds.
        for i in 0..5 {
            assert!(backend
                .try_acquire(&key(&format!("job-{}", i)), "worker-2", Duration::from_secs(30))
                .await
                .unwrap());
        }
    }

    #[tokio::test]
    async fn test_sqlite_health_check() {
        let dir = TempDir::new().unwrap();
        let backend = create_backend(&dir).await;
        assert!(backend.health_check().await);
    }

    #[tokio::test]
    async fn test_sqlite_two_pools_share_one_lock_space() {
        // Two backends on the same file model two worker processes on
        // one node: the uniqueness constraint still applies across them.
        let dir = TempDir::new().unwrap();
        let backend_a = create_backend(&dir).await;
        let backend_b = create_backend(&dir).await;

        assert!(backend_a
            .try_acquire(&key("job-1"), "proc-a", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(!backend_b
            .try_acquire(&key("job-1"), "proc-b", Duration::from_secs(30))
            .await
            .unwrap());

        assert!(backend_a.release(&key("job-1"), "proc-a").await.unwrap());
        assert!(backend_b
            .try_acquire(&key("job-1"), "proc-b", Duration::from_secs(30))
            .await
            .unwrap());
    }
}
