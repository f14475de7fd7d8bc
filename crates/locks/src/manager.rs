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

//! Lock manager: the worker-facing acquisition API over any backend.
//!
//! ## Purpose
//! Wraps a [`LockBackend`] with the calling conventions workers need:
//! scoped acquisition returning a guard that releases on every exit
//! path, manual acquire/release for callers that manage their own
//! lifecycle, and auto-generated holder ids so two tasks in one
//! process never share an identity.
//!
//! ## Design
//! - Contention and timeouts are plain `false`/`None`; backend faults
//!   on the release path are logged and swallowed because the TTL
//!   already bounds the damage of a lease that outlives its worker.
//! - [`LockGuard::release`] is the normal path. `Drop` is the safety
//!   net: it spawns a best-effort release onto the runtime, and when no
//!   runtime is left (process teardown) the lease simply expires.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use ulid::Ulid;

use crate::backend::{Lease, LockBackend, LockKey};
use crate::error::LockResult;
use crate::metrics::LockMetricsSnapshot;

/// Worker-facing lock API bound to one backend.
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    default_ttl: Duration,
    acquire_timeout: Duration,
}

impl LockManager {
    /// Wrap a backend with the given lease TTL and acquire deadline
    /// defaults (normally taken from [`LockConfig`](crate::LockConfig)).
    pub fn new(backend: Arc<dyn LockBackend>, default_ttl: Duration, acquire_timeout: Duration) -> Self {
        Self {
            backend,
            default_ttl,
            acquire_timeout,
        }
    }

    /// Fresh holder identity: process id plus a random suffix, unique
    /// per acquisition scope.
    pub fn generate_holder_id() -> String {
        format!("worker-{}-{}", std::process::id(), Ulid::new())
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Counters for the underlying backend.
    pub fn metrics(&self) -> LockMetricsSnapshot {
        self.backend.metrics().snapshot()
    }

    pub async fn health_check(&self) -> bool {
        self.backend.health_check().await
    }

    /// Current lease on `key`, if any.
    pub async fn get(&self, key: &LockKey) -> LockResult<Option<Lease>> {
        self.backend.get(key).await
    }

    /// Acquire with explicit holder, TTL, and deadline.
    ///
    /// Retries until won or timed out; `false` means the caller should
    /// skip this cycle, not crash.
    #[instrument(skip(self), fields(lock_key = %key, backend = self.backend.name()))]
    pub async fn acquire(
        &self,
        key: &LockKey,
        holder_id: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> bool {
        self.backend.acquire(key, holder_id, ttl, timeout).await
    }

    /// Release a manually acquired lease.
    ///
    /// `false` when the lease was not held by `holder_id` (already
    /// expired and taken over, or never acquired) or when the backend
    /// failed; neither is worth unwinding a worker for.
    #[instrument(skip(self), fields(lock_key = %key, backend = self.backend.name()))]
    pub async fn release(&self, key: &LockKey, holder_id: &str) -> bool {
        match self.backend.release(key, holder_id).await {
            Ok(released) => {
                if !released {
                    debug!(holder_id, "lease not held by this holder at release");
                }
                released
            }
            Err(e) => {
                warn!(holder_id, error = %e, "lease release failed; lease will expire via TTL");
                false
            }
        }
    }

    /// Scoped acquisition with the configured defaults.
    pub async fn lock(&self, key: &LockKey) -> Option<LockGuard> {
        self.with_lock(key, self.acquire_timeout).await
    }

    /// Scoped acquisition with an explicit deadline.
    ///
    /// Generates a holder id, runs the retrying acquire, and returns a
    /// guard whose drop releases the lease. `None` means the deadline
    /// elapsed while the key stayed held.
    #[instrument(skip(self), fields(lock_key = %key, backend = self.backend.name()))]
    pub async fn with_lock(&self, key: &LockKey, timeout: Duration) -> Option<LockGuard> {
        let holder_id = Self::generate_holder_id();
        if self
            .backend
            .acquire(key, &holder_id, self.default_ttl, timeout)
            .await
        {
            Some(LockGuard {
                backend: Arc::clone(&self.backend),
                key: key.clone(),
                holder_id,
                released: false,
            })
        } else {
            None
        }
    }
}

/// Holds one lease; releasing it on every exit path.
///
/// Prefer [`LockGuard::release`] so the release is awaited in-line.
/// Dropping the guard instead spawns the release as a detached task;
/// if no runtime is available the lease is left to its TTL.
#[must_use = "dropping the guard immediately releases the lease"]
pub struct LockGuard {
    backend: Arc<dyn LockBackend>,
    key: LockKey,
    holder_id: String,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    /// Holder id this lease was granted to.
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Release the lease now.
    ///
    /// `false` when the lease had already lapsed and been taken over,
    /// or the backend failed (logged; the TTL cleans up).
    pub async fn release(mut self) -> bool {
        self.released = true;
        match self.backend.release(&self.key, &self.holder_id).await {
            Ok(released) => {
                if !released {
                    warn!(lock_key = %self.key, holder_id = %self.holder_id, "lease no longer held at release");
                }
                released
            }
            Err(e) => {
                warn!(lock_key = %self.key, error = %e, "lease release failed; lease will expire via TTL");
                false
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let backend = Arc::clone(&self.backend);
        let key = self.key.clone();
        let holder_id = std::mem::take(&mut self.holder_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = backend.release(&key, &holder_id).await {
                        warn!(lock_key = %key, error = %e, "best-effort lease release failed");
                    }
                });
            }
            Err(_) => {
                debug!(lock_key = %key, "no runtime at guard drop; lease left to expire");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLockBackend;

    fn manager_over(backend: Arc<MemoryLockBackend>) -> LockManager {
        LockManager::new(backend, Duration::from_secs(30), Duration::from_millis(200))
    }

    #[test]
    fn test_manager_reports_configured_defaults() {
        let manager = manager_over(Arc::new(MemoryLockBackend::new()));
        assert_eq!(manager.backend_name(), "memory");
        assert_eq!(manager.default_ttl(), Duration::from_secs(30));
        assert_eq!(manager.acquire_timeout(), Duration::from_millis(200));
    }

    #[test]
    fn test_holder_ids_are_unique_and_tagged() {
        let a = LockManager::generate_holder_id();
        let b = LockManager::generate_holder_id();
        assert!(a.starts_with("worker-"));
        assert!(a.contains(&std::process::id().to_string()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_with_lock_grants_and_blocks() {
        let backend = Arc::new(MemoryLockBackend::new());
        let manager = manager_over(backend.clone());
        let key = LockKey::new("upwork", "job-1");

        let guard = manager.with_lock(&key, Duration::from_millis(100)).await;
        assert!(guard.is_some());

        // Second scope conflicts until the first guard goes away.
        assert!(manager.with_lock(&key, Duration::from_millis(100)).await.is_none());

        assert!(guard.unwrap().release().await);
        assert!(manager.with_lock(&key, Duration::from_millis(100)).await.is_some());
    }

    #[tokio::test]
    async fn test_guard_drop_releases() {
        let backend = Arc::new(MemoryLockBackend::new());
        let manager = manager_over(backend.clone());
        let key = LockKey::new("upwork", "job-1");

        let guard = manager.lock(&key).await.unwrap();
        assert!(backend.get(&key).await.unwrap().is_some());

        drop(guard);
        // The drop path spawns the release; give it a beat to run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(backend.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_manual_acquire_and_release() {
        let backend = Arc::new(MemoryLockBackend::new());
        let manager = manager_over(backend);
        let key = LockKey::new("upwork", "job-1");

        assert!(
            manager
                .acquire(&key, "worker-a", Duration::from_secs(5), Duration::from_millis(100))
                .await
        );
        // Wrong holder cannot release.
        assert!(!manager.release(&key, "worker-b").await);
        assert!(manager.release(&key, "worker-a").await);
        // Releasing twice reports false without error.
        assert!(!manager.release(&key, "worker-a").await);
    }

    #[tokio::test]
    async fn test_metrics_passthrough() {
        let backend = Arc::new(MemoryLockBackend::new());
        let manager = manager_over(backend);
        let key = LockKey::new("upwork", "job-1");

        let guard = manager.lock(&key).await.unwrap();
        let snap = manager.metrics();
        assert_eq!(snap.successes, 1);
        guard.release().await;
    }
}
