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

//! Lock backend trait and the lease data model.
//!
//! ## Purpose
//! One trait, [`LockBackend`], abstracts every lease store behind the
//! same contract: a single-shot atomic `try_acquire`, a holder-guarded
//! `release`, and a retrying `acquire` built on top of them. Providers
//! implement the single-shot primitives; the retry schedule lives here
//! so every backend waits the same way.
//!
//! ## Design
//! - `try_acquire` is set-if-absent-with-expiry. No reentrancy: a
//!   holder that already owns the lease conflicts like anyone else.
//!   Callers use one holder id per acquisition scope.
//! - `acquire` retries with capped exponential backoff plus jitter,
//!   sleeping only through `tokio::time::sleep` so contended workers
//!   yield to the scheduler instead of stalling a thread.
//! - Expiry is the crash recovery mechanism. There is no renewal; work
//!   that can outlive the TTL needs a longer TTL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::LockResult;
use crate::metrics::LockMetrics;

/// First retry delay for a contended acquire.
pub const BASE_RETRY_DELAY_MS: u64 = 25;
/// Upper bound for a single retry delay.
pub const MAX_RETRY_DELAY_MS: u64 = 1_000;

/// Identity of the resource a lease protects: one opportunity on one
/// marketplace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub marketplace: String,
    pub opportunity: String,
}

impl LockKey {
    pub fn new(marketplace: impl Into<String>, opportunity: impl Into<String>) -> Self {
        Self {
            marketplace: marketplace.into(),
            opportunity: opportunity.into(),
        }
    }

    /// Composite key as stored by the backends.
    pub fn storage_key(&self) -> String {
        format!("{}#{}", self.marketplace, self.opportunity)
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.marketplace, self.opportunity)
    }
}

/// A granted lease on a lock key.
///
/// Leases are transient: created by a successful acquire, destroyed by
/// release or expiry. The backend store is the only source of truth;
/// this struct is a point-in-time view for introspection and logging.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Lease {
    /// Storage key (see [`LockKey::storage_key`])
    pub key: String,
    /// Owner allowed to release this lease
    pub holder_id: String,
    /// When the lease was granted. `None` for backends that keep only
    /// the holder and a TTL (Redis stores the bare holder id so the
    /// compare-and-delete release stays a two-line script).
    pub acquired_at: Option<DateTime<Utc>>,
    /// When the lease lapses on its own
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Time left before expiry, zero if already lapsed.
    pub fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Retry delay for the given zero-based attempt number: exponential
/// growth from [`BASE_RETRY_DELAY_MS`] capped at [`MAX_RETRY_DELAY_MS`],
/// plus uniform jitter of up to one base delay so simultaneous losers
/// spread out.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let delay = BASE_RETRY_DELAY_MS as f64 * 2f64.powi(attempt.min(16) as i32);
    let capped = delay.min(MAX_RETRY_DELAY_MS as f64) as u64;
    let jitter = rand::thread_rng().gen_range(0..=BASE_RETRY_DELAY_MS);
    Duration::from_millis(capped + jitter)
}

/// Storage provider for opportunity leases.
///
/// ## Contract
/// - At most one unexpired lease exists per key.
/// - `try_acquire` either creates the lease atomically or reports the
///   key as held; partial states are impossible.
/// - `release` removes the lease only when the holder matches, so a
///   slow worker whose lease lapsed cannot evict the next holder.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// One atomic set-if-absent-with-expiry attempt.
    ///
    /// ## Returns
    /// - `Ok(true)`: lease created for `holder_id`
    /// - `Ok(false)`: key held by an unexpired lease
    /// - `Err(LockError::BackendError)`: storage or network failure
    async fn try_acquire(&self, key: &LockKey, holder_id: &str, ttl: Duration)
        -> LockResult<bool>;

    /// Remove the lease if and only if `holder_id` owns it.
    ///
    /// ## Returns
    /// - `Ok(true)`: lease removed
    /// - `Ok(false)`: no lease, or held by someone else (left intact)
    async fn release(&self, key: &LockKey, holder_id: &str) -> LockResult<bool>;

    /// Current lease on `key`, if any unexpired one exists.
    async fn get(&self, key: &LockKey) -> LockResult<Option<Lease>>;

    /// Cheap liveness probe; used by backend selection.
    async fn health_check(&self) -> bool;

    /// Short backend label for logs and metric labels.
    fn name(&self) -> &'static str;

    /// Counters owned by this backend instance.
    fn metrics(&self) -> &LockMetrics;

    /// Retry `try_acquire` until it wins or `timeout` elapses.
    ///
    /// ## Behavior
    /// - Conflicts back off exponentially with jitter, never sleeping
    ///   past the deadline.
    /// - Backend errors are counted, logged, and retried; the deadline
    ///   still bounds the whole call.
    /// - Never returns an error: the outcome is acquired or not.
    async fn acquire(
        &self,
        key: &LockKey,
        holder_id: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut attempt: u32 = 0;

        loop {
            match self.try_acquire(key, holder_id, ttl).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    self.metrics().record_backend_error();
                    warn!(
                        key = %key,
                        backend = self.name(),
                        error = %e,
                        "lock acquire attempt failed"
                    );
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                self.metrics().record_timeout();
                debug!(
                    key = %key,
                    holder_id,
                    backend = self.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "lock acquire timed out"
                );
                return false;
            }

            let delay = backoff_delay(attempt).min(deadline - now);
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }
}
