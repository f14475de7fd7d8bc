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

//! Error types for bid storage and coordination.

use thiserror::Error;

/// Result type for bidding operations.
pub type BidResult<T> = Result<T, BidError>;

/// Errors raised by the bid store and coordinator.
///
/// A lost duplicate race is represented as [`BidError::DuplicateBid`] at
/// the storage layer only; the coordinator converts it into the
/// `(existing, created = false)` outcome rather than surfacing it.
#[derive(Error, Debug)]
pub enum BidError {
    /// Underlying database error.
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// No bid exists with the given id.
    #[error("Bid not found: {0}")]
    NotFound(String),

    /// An active claim already exists for this (marketplace, opportunity).
    #[error("Duplicate bid for {marketplace}/{opportunity}")]
    DuplicateBid {
        marketplace: String,
        opportunity: String,
    },

    /// A stored status string does not name a known bid status.
    #[error("Invalid bid status: {0}")]
    InvalidStatus(String),
}
