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

//! Bid domain model.
//!
//! ## Purpose
//! Defines the bid record, its lifecycle statuses, and the draft input
//! used to place a new bid. A bid is keyed by id but claims an
//! opportunity through the `(marketplace, opportunity)` pair; at most
//! one bid may hold an active claim on that pair at a time.
//!
//! ## Lifecycle
//! ```text
//! PENDING -> SUBMITTED -> ACTIVE -> ACCEPTED
//!    |           |          |
//!    |           +----------+--> REJECTED | WITHDRAWN
//!    +--> EXPIRED | DUPLICATE
//! ```
//! `WITHDRAWN` is reachable only from `ACTIVE` and `SUBMITTED`.
//! `EXPIRED` is reachable from any open status. `DUPLICATE` is applied
//! by the repair sweep, never by normal placement.

use crate::error::BidError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a bid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BidStatus {
    /// Created locally, not yet sent to the marketplace.
    Pending,
    /// Sent to the marketplace, awaiting listing.
    Submitted,
    /// Live on the marketplace.
    Active,
    /// The marketplace awarded the opportunity to this bid.
    Accepted,
    /// The marketplace declined this bid.
    Rejected,
    /// Withdrawn by the bidder before a decision.
    Withdrawn,
    /// The opportunity closed before a decision.
    Expired,
    /// Flagged by the repair sweep as a redundant claim.
    Duplicate,
}

impl BidStatus {
    /// Stable storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            BidStatus::Pending => "PENDING",
            BidStatus::Submitted => "SUBMITTED",
            BidStatus::Active => "ACTIVE",
            BidStatus::Accepted => "ACCEPTED",
            BidStatus::Rejected => "REJECTED",
            BidStatus::Withdrawn => "WITHDRAWN",
            BidStatus::Expired => "EXPIRED",
            BidStatus::Duplicate => "DUPLICATE",
        }
    }

    /// Whether a bid in this status may be withdrawn.
    pub fn can_withdraw(&self) -> bool {
        matches!(self, BidStatus::Active | BidStatus::Submitted)
    }

    /// Whether a bid in this status claims its opportunity.
    ///
    /// At most one active claim may exist per `(marketplace,
    /// opportunity)`; placement treats any of these as "already bid".
    pub fn is_active_claim(&self) -> bool {
        matches!(
            self,
            BidStatus::Pending | BidStatus::Submitted | BidStatus::Active | BidStatus::Accepted
        )
    }
}

impl fmt::Display for BidStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BidStatus {
    type Err = BidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(BidStatus::Pending),
            "SUBMITTED" => Ok(BidStatus::Submitted),
            "ACTIVE" => Ok(BidStatus::Active),
            "ACCEPTED" => Ok(BidStatus::Accepted),
            "REJECTED" => Ok(BidStatus::Rejected),
            "WITHDRAWN" => Ok(BidStatus::Withdrawn),
            "EXPIRED" => Ok(BidStatus::Expired),
            "DUPLICATE" => Ok(BidStatus::Duplicate),
            other => Err(BidError::InvalidStatus(other.to_string())),
        }
    }
}

/// A stored bid record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    /// Unique bid id (ULID).
    pub id: String,
    /// Marketplace the opportunity belongs to.
    pub marketplace: String,
    /// Opportunity identifier within the marketplace.
    pub opportunity: String,
    /// Current lifecycle status.
    pub status: BidStatus,
    /// Offered amount in minor currency units.
    pub amount_cents: i64,
    /// ISO 4217 currency code.
    pub currency: String,
    /// Free-form proposal text sent with the bid.
    pub proposal: String,
    /// Worker or user that placed the bid.
    pub placed_by: String,
    /// Id of the most recent state-change event (ULID). Rotated on
    /// every successful mutation.
    pub event_id: String,
    /// When the bid row was created.
    pub created_at: DateTime<Utc>,
    /// When the bid row was last mutated.
    pub updated_at: DateTime<Utc>,
    /// Reason supplied at withdrawal, if any.
    pub withdrawal_reason: Option<String>,
    /// When the bid was withdrawn, if it was.
    pub withdrawn_at: Option<DateTime<Utc>>,
}

/// Input for placing a new bid.
///
/// ## Examples
/// ```rust
/// use dibs_bidding::BidDraft;
///
/// let draft = BidDraft::new("upwork", "job-42", 150_00, "worker-7")
///     .with_proposal("Three week delivery, fixed price.");
/// assert_eq!(draft.currency, "USD");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidDraft {
    pub marketplace: String,
    pub opportunity: String,
    pub amount_cents: i64,
    pub currency: String,
    pub proposal: String,
    pub placed_by: String,
}

impl BidDraft {
    /// Create a draft with the default currency (`USD`) and an empty
    /// proposal.
    pub fn new(
        marketplace: impl Into<String>,
        opportunity: impl Into<String>,
        amount_cents: i64,
        placed_by: impl Into<String>,
    ) -> Self {
        Self {
            marketplace: marketplace.into(),
            opportunity: opportunity.into(),
            amount_cents,
            currency: "USD".to_string(),
            proposal: String::new(),
            placed_by: placed_by.into(),
        }
    }

    /// Set the proposal text.
    pub fn with_proposal(mut self, proposal: impl Into<String>) -> Self {
        self.proposal = proposal.into();
        self
    }

    /// Set the currency code.
    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_storage_form() {
        for status in [
            BidStatus::Pending,
            BidStatus::Submitted,
            BidStatus::Active,
            BidStatus::Accepted,
            BidStatus::Rejected,
            BidStatus::Withdrawn,
            BidStatus::Expired,
            BidStatus::Duplicate,
        ] {
            assert_eq!(status.as_str().parse::<BidStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let err = "SHIPPED".parse::<BidStatus>().unwrap_err();
        assert!(matches!(err, BidError::InvalidStatus(s) if s == "SHIPPED"));
    }

    #[test]
    fn test_withdrawable_statuses() {
        assert!(BidStatus::Active.can_withdraw());
        assert!(BidStatus::Submitted.can_withdraw());
        assert!(!BidStatus::Pending.can_withdraw());
        assert!(!BidStatus::Accepted.can_withdraw());
        assert!(!BidStatus::Withdrawn.can_withdraw());
    }

    #[test]
    fn test_active_claim_statuses() {
        assert!(BidStatus::Pending.is_active_claim());
        assert!(BidStatus::Submitted.is_active_claim());
        assert!(BidStatus::Active.is_active_claim());
        assert!(BidStatus::Accepted.is_active_claim());
        assert!(!BidStatus::Rejected.is_active_claim());
        assert!(!BidStatus::Withdrawn.is_active_claim());
        assert!(!BidStatus::Expired.is_active_claim());
        assert!(!BidStatus::Duplicate.is_active_claim());
    }

    #[test]
    fn test_draft_builder_defaults() {
        let draft = BidDraft::new("upwork", "job-1", 5000, "worker-1");
        assert_eq!(draft.currency, "USD");
        assert!(draft.proposal.is_empty());

        let draft = draft.with_currency("EUR").with_proposal("hello");
        assert_eq!(draft.currency, "EUR");
        assert_eq!(draft.proposal, "hello");
    }
}
