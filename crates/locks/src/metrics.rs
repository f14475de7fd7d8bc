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

//! Acquisition counters shared by every lock backend.
//!
//! ## Purpose
//! Each backend owns one [`LockMetrics`] instance counting attempts,
//! successes, conflicts, timeouts, and backend errors. Counts are kept
//! in process-local atomics so callers can read them without an
//! exporter, and mirrored to the `metrics` facade (labelled by backend)
//! for whatever recorder the host application installs.
//!
//! ## Design
//! - Purely additive: recording never fails and never blocks.
//! - `Relaxed` ordering is enough; counters are monotonic and never
//!   gate control flow.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters for one lock backend instance.
#[derive(Debug)]
pub struct LockMetrics {
    backend: &'static str,
    attempts: AtomicU64,
    successes: AtomicU64,
    conflicts: AtomicU64,
    timeouts: AtomicU64,
    backend_errors: AtomicU64,
}

impl LockMetrics {
    /// Create a zeroed counter set for the named backend.
    pub fn new(backend: &'static str) -> Self {
        Self {
            backend,
            attempts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            backend_errors: AtomicU64::new(0),
        }
    }

    /// One `try_acquire` round-trip to the backend.
    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dibs_lock_attempts_total", "backend" => self.backend).increment(1);
    }

    /// A lease was created.
    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dibs_lock_acquired_total", "backend" => self.backend).increment(1);
    }

    /// The key was already held by an unexpired lease.
    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dibs_lock_conflicts_total", "backend" => self.backend).increment(1);
    }

    /// An acquire deadline elapsed without winning the lease.
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dibs_lock_timeouts_total", "backend" => self.backend).increment(1);
    }

    /// A storage or network failure during an acquire round.
    pub fn record_backend_error(&self) {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dibs_lock_backend_errors_total", "backend" => self.backend).increment(1);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> LockMetricsSnapshot {
        LockMetricsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`LockMetrics`] counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockMetricsSnapshot {
    /// Individual set-if-absent attempts against the backend
    pub attempts: u64,
    /// Leases created
    pub successes: u64,
    /// Attempts that found the key held
    pub conflicts: u64,
    /// Acquire calls that gave up at their deadline
    pub timeouts: u64,
    /// Storage/network failures observed while acquiring
    pub backend_errors: u64,
}
