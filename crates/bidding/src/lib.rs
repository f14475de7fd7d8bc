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

//! # Dibs Bidding
//!
//! ## Purpose
//! Bid lifecycle for marketplace workers: place at most one bid per
//! opportunity, move it through its statuses, and withdraw it safely.
//! Placement and withdrawal are the two operations concurrent workers
//! actually race on, so both are built to lose races gracefully.
//!
//! ## Architecture Context
//! Sits on top of `dibs-locks`. A worker takes the per-opportunity
//! lease, then calls [`BidCoordinator::create_if_absent`]; storage
//! keeps a partial unique index over open claims as the second line of
//! defense, so even workers that skip the lease cannot double-bid
//! within one store.
//!
//! ## Design Decisions
//! - Losing a placement race returns `(existing, created = false)`,
//!   never an error
//! - [`BidCoordinator::withdraw`] returns `bool` and never raises;
//!   failures roll back and log
//! - [`BidCoordinator::withdraw_on`] nests as a savepoint on the
//!   caller's connection, leaving the outer transaction intact
//! - Every applied mutation rotates the bid's event id (ULID)
//! - Timestamps are UNIX epoch milliseconds in storage
//!
//! ## Examples
//! ```rust,no_run
//! use dibs_bidding::{BidCoordinator, BidDraft, BidStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let locks = Arc::new(dibs_locks::create_lock_manager_from_env().await?);
//! let store = BidStore::open("sqlite:dibs-bids.db?mode=rwc").await?;
//! let coordinator = BidCoordinator::new(locks, store);
//!
//! // Serialize placement per opportunity, then dedup inside storage.
//! let _guard = coordinator.lock_opportunity("upwork", "job-42").await;
//! let (bid, created) = coordinator
//!     .create_if_absent(BidDraft::new("upwork", "job-42", 150_00, "worker-7"))
//!     .await?;
//! if !created {
//!     println!("already bid on job-42 as {}", bid.id);
//! }
//!
//! // Later, on a decision change:
//! if coordinator.withdraw(&bid.id, "budget reallocated").await {
//!     println!("bid {} withdrawn", bid.id);
//! }
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod error;
pub mod model;
pub mod store;

pub use coordinator::BidCoordinator;
pub use error::{BidError, BidResult};
pub use model::{Bid, BidDraft, BidStatus};
pub use store::BidStore;
