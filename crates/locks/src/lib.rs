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

//! # Dibs Opportunity Locks
//!
//! ## Purpose
//! Lease-based mutual exclusion for marketplace workers: at most one
//! worker at a time may act on a given (marketplace, opportunity) pair.
//! Leases carry a TTL so a crashed holder frees its key without any
//! cleanup protocol.
//!
//! ## Architecture Context
//! This crate is used by:
//! - **Bid Coordinator** (`dibs-bidding`): serializes bid creation per
//!   opportunity so the dedup check and the insert act as one step
//! - **Any worker loop** that must not double-process a resource
//!
//! ## Design Decisions
//! - **Set-if-absent acquire**: one atomic primitive per backend (Redis
//!   `SET NX PX`, SQLite primary-key insert); no read-then-write races
//! - **Holder-guarded release**: only the lease owner can delete it, so
//!   expired holders cannot evict their successors
//! - **TTL-only recovery**: no heartbeats, no renewal; pick a TTL longer
//!   than the longest critical section
//! - **Cooperative waiting**: contended acquires back off through
//!   `tokio::time::sleep`, never blocking a thread
//!
//! ## Backend Support
//!
//! - **Memory**: process-local HashMap (always available, for testing)
//! - **SQLite**: persistent, single-node fallback (feature: `sqlite-backend`)
//! - **Redis**: shared, multi-node, native TTL (feature: `redis-backend`)
//!
//! ## Examples
//!
//! ### Scoped locking
//! ```rust,no_run
//! use dibs_locks::{create_lock_manager_from_env, LockKey};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = create_lock_manager_from_env().await?;
//! let key = LockKey::new("upwork", "job-42");
//!
//! if let Some(guard) = manager.lock(&key).await {
//!     // ... examine and bid on the opportunity ...
//!     guard.release().await;
//! } else {
//!     // another worker owns this opportunity; skip this cycle
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Manual control
//! ```rust,no_run
//! use dibs_locks::{LockKey, LockManager, MemoryLockBackend};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let manager = LockManager::new(
//!     Arc::new(MemoryLockBackend::new()),
//!     Duration::from_secs(60),
//!     Duration::from_secs(5),
//! );
//! let key = LockKey::new("upwork", "job-42");
//! let holder = LockManager::generate_holder_id();
//!
//! if manager.acquire(&key, &holder, Duration::from_secs(60), Duration::from_secs(5)).await {
//!     // ... critical section ...
//!     manager.release(&key, &holder).await;
//! }
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod manager;
pub mod memory;
pub mod metrics;

#[cfg(feature = "redis-backend")]
pub mod redis;

#[cfg(feature = "sqlite-backend")]
pub mod sql;

pub use backend::{Lease, LockBackend, LockKey};
pub use config::{
    create_lock_manager, create_lock_manager_from_env, LockBackendKind, LockConfig,
};
pub use error::{LockError, LockResult};
pub use manager::{LockGuard, LockManager};
pub use memory::MemoryLockBackend;
// self:: disambiguates from the external crates of the same name.
pub use self::metrics::{LockMetrics, LockMetricsSnapshot};

#[cfg(feature = "redis-backend")]
pub use self::redis::RedisLockBackend;

#[cfg(feature = "sqlite-backend")]
pub use sql::SqliteLockBackend;
