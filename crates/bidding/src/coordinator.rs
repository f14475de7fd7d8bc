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

//! Bid lifecycle coordination.
//!
//! ## Purpose
//! Ties the opportunity lock to bid storage. Placement runs behind two
//! defenses: workers serialize on the per-opportunity lease, and the
//! open-claim index rejects concurrent inserts that slip past it.
//! Either way a lost race resolves to `(existing, created = false)`,
//! never to an error.
//!
//! ## Withdrawal contract
//! [`BidCoordinator::withdraw`] reports `bool` and never raises: a
//! missing bid, an ineligible status, and a storage failure all roll
//! back and return `false`. When a caller is already inside a
//! transaction, [`BidCoordinator::withdraw_on`] runs the same protocol
//! in a savepoint on the caller's connection, so a failed withdrawal
//! leaves the surrounding transaction intact.

use sqlx::{Connection, Row, Sqlite, SqliteConnection, Transaction};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use ulid::Ulid;

use dibs_locks::{LockGuard, LockKey, LockManager};

use crate::error::{BidError, BidResult};
use crate::model::{Bid, BidDraft, BidStatus};
use crate::store::{
    bind_bid, is_unique_violation, now_epoch_ms, now_utc_ms, row_to_bid, BidStore, INSERT_BID,
};

/// Coordinates bid placement and lifecycle transitions.
///
/// ## Examples
/// ```rust,no_run
/// use dibs_bidding::{BidCoordinator, BidDraft, BidStore};
/// use dibs_locks::{LockManager, MemoryLockBackend};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = BidStore::open("sqlite:dibs-bids.db?mode=rwc").await?;
/// let locks = Arc::new(LockManager::new(
///     Arc::new(MemoryLockBackend::new()),
///     Duration::from_secs(60),
///     Duration::from_secs(5),
/// ));
/// let coordinator = BidCoordinator::new(locks, store);
///
/// // Hold the opportunity lease while deciding whether to bid.
/// let _guard = coordinator.lock_opportunity("upwork", "job-42").await;
/// let (bid, created) = coordinator
///     .create_if_absent(BidDraft::new("upwork", "job-42", 150_00, "worker-7"))
///     .await?;
/// if !created {
///     println!("opportunity already claimed by bid {}", bid.id);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BidCoordinator {
    locks: Arc<LockManager>,
    store: BidStore,
}

impl BidCoordinator {
    /// Create a coordinator over a lock manager and a bid store.
    pub fn new(locks: Arc<LockManager>, store: BidStore) -> Self {
        Self { locks, store }
    }

    /// The bid store this coordinator writes to.
    pub fn store(&self) -> &BidStore {
        &self.store
    }

    /// The lock manager guarding opportunities.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Acquire the per-opportunity lease, retrying until the manager's
    /// acquire timeout lapses.
    ///
    /// ## Returns
    /// A guard that releases on drop, or `None` when the lease stayed
    /// contended for the whole timeout. Callers may still place a bid
    /// without the lease; the open-claim index remains in force.
    pub async fn lock_opportunity(&self, marketplace: &str, opportunity: &str) -> Option<LockGuard> {
        self.locks
            .lock(&LockKey::new(marketplace, opportunity))
            .await
    }

    /// Place a bid unless the opportunity is already claimed.
    ///
    /// ## Returns
    /// `(bid, true)` when this call created the bid, `(existing, false)`
    /// when any active claim already existed. Losing the insert race to
    /// a concurrent worker is reported the same way as finding the
    /// claim up front.
    ///
    /// ## Errors
    /// Returns [`BidError::Storage`] only for real database failures;
    /// contention is never an error. Failures are logged with the
    /// attempt's event id before they surface.
    #[instrument(skip(self, draft), fields(marketplace = %draft.marketplace, opportunity = %draft.opportunity))]
    pub async fn create_if_absent(&self, draft: BidDraft) -> BidResult<(Bid, bool)> {
        // Event id for this placement attempt; becomes the bid's first
        // event id when the insert lands, and correlates the failure
        // log with any retry when it does not.
        let event_id = Ulid::new().to_string();
        match self.place_bid(&event_id, draft).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                error!(event_id = %event_id, error = %err, "bid placement failed");
                Err(err)
            }
        }
    }

    async fn place_bid(&self, event_id: &str, draft: BidDraft) -> BidResult<(Bid, bool)> {
        let mut tx = self.store.pool().begin().await?;

        let existing = sqlx::query(
            r#"SELECT id, marketplace, opportunity, status, amount_cents, currency, proposal,
                      placed_by, event_id, created_at, updated_at, withdrawal_reason, withdrawn_at
               FROM bids
               WHERE marketplace = ?1 AND opportunity = ?2
                 AND status IN ('PENDING', 'SUBMITTED', 'ACTIVE', 'ACCEPTED')
               ORDER BY created_at ASC, id ASC
               LIMIT 1"#,
        )
        .bind(&draft.marketplace)
        .bind(&draft.opportunity)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            let bid = row_to_bid(&row)?;
            // Read-only transaction; nothing to undo.
            tx.commit().await?;
            metrics::counter!("dibs_bids_deduplicated_total", "marketplace" => bid.marketplace.clone())
                .increment(1);
            debug!(bid_id = %bid.id, "opportunity already claimed; returning existing bid");
            return Ok((bid, false));
        }

        let now = now_utc_ms();
        let bid = Bid {
            id: Ulid::new().to_string(),
            marketplace: draft.marketplace,
            opportunity: draft.opportunity,
            status: BidStatus::Pending,
            amount_cents: draft.amount_cents,
            currency: draft.currency,
            proposal: draft.proposal,
            placed_by: draft.placed_by,
            event_id: event_id.to_string(),
            created_at: now,
            updated_at: now,
            withdrawal_reason: None,
            withdrawn_at: None,
        };

        match bind_bid(sqlx::query(INSERT_BID), &bid).execute(&mut *tx).await {
            Ok(_) => {
                tx.commit().await?;
                metrics::counter!("dibs_bids_created_total", "marketplace" => bid.marketplace.clone())
                    .increment(1);
                info!(bid_id = %bid.id, amount_cents = bid.amount_cents, "bid created");
                Ok((bid, true))
            }
            Err(err) if is_unique_violation(&err) => {
                // Lost the insert race; the committed row wins. Release
                // the transaction before re-reading so the fresh fetch
                // sees the winner.
                tx.rollback().await?;
                let existing = self
                    .store
                    .find_active(&bid.marketplace, &bid.opportunity)
                    .await?
                    .ok_or_else(|| BidError::DuplicateBid {
                        marketplace: bid.marketplace.clone(),
                        opportunity: bid.opportunity.clone(),
                    })?;
                metrics::counter!("dibs_bids_deduplicated_total", "marketplace" => bid.marketplace.clone())
                    .increment(1);
                debug!(bid_id = %existing.id, "lost create race; returning existing bid");
                Ok((existing, false))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Withdraw a bid on its own connection.
    ///
    /// ## Returns
    /// `true` when this call moved the bid to `WITHDRAWN`; `false` for
    /// a missing bid, a status outside `ACTIVE`/`SUBMITTED` (including
    /// an earlier withdrawal), or a storage failure. Never raises.
    pub async fn withdraw(&self, bid_id: &str, reason: &str) -> bool {
        let mut conn = match self.store.pool().acquire().await {
            Ok(conn) => conn,
            Err(err) => {
                error!(bid_id, error = %err, "withdraw: failed to acquire connection");
                return false;
            }
        };
        self.withdraw_on(&mut conn, bid_id, reason).await
    }

    /// Withdraw a bid on the caller's connection.
    ///
    /// ## Behavior
    /// Opens a transaction on `conn`; when `conn` already has one in
    /// progress this nests as a savepoint, so a `false` outcome rolls
    /// back only the withdrawal and the caller's transaction survives.
    /// The row is re-read under the transaction and the final update
    /// re-checks the status, so a repeat withdrawal leaves the row
    /// untouched, timestamps included.
    #[instrument(skip(self, conn, reason), fields(bid_id = %bid_id))]
    pub async fn withdraw_on(
        &self,
        conn: &mut SqliteConnection,
        bid_id: &str,
        reason: &str,
    ) -> bool {
        // Mint the event id before touching storage so the audit trail
        // orders by intent rather than by commit.
        let event_id = Ulid::new().to_string();

        let mut tx = match conn.begin().await {
            Ok(tx) => tx,
            Err(err) => {
                error!(bid_id, event_id = %event_id, error = %err, "withdraw: failed to open transaction");
                return false;
            }
        };

        let row = match sqlx::query(r#"SELECT marketplace, status FROM bids WHERE id = ?1"#)
            .bind(bid_id)
            .fetch_optional(&mut *tx)
            .await
        {
            Ok(row) => row,
            Err(err) => {
                error!(bid_id, event_id = %event_id, error = %err, "withdraw: failed to read bid");
                rollback_quietly(tx, bid_id).await;
                return false;
            }
        };

        let Some(row) = row else {
            rollback_quietly(tx, bid_id).await;
            warn!(bid_id, event_id = %event_id, "withdraw: bid not found");
            return false;
        };

        let marketplace: String = row.get("marketplace");
        let status = match row.get::<String, _>("status").parse::<BidStatus>() {
            Ok(status) => status,
            Err(err) => {
                error!(bid_id, event_id = %event_id, error = %err, "withdraw: unreadable status");
                rollback_quietly(tx, bid_id).await;
                return false;
            }
        };

        if !status.can_withdraw() {
            rollback_quietly(tx, bid_id).await;
            warn!(bid_id, event_id = %event_id, previous = %status, "withdraw rejected: bid is not withdrawable");
            metrics::counter!("dibs_bid_withdrawals_rejected_total", "marketplace" => marketplace)
                .increment(1);
            return false;
        }

        let now_ms = now_epoch_ms();
        let updated = sqlx::query(
            r#"UPDATE bids
               SET status = 'WITHDRAWN', withdrawal_reason = ?1, withdrawn_at = ?2,
                   updated_at = ?2, event_id = ?3
               WHERE id = ?4 AND status = ?5"#,
        )
        .bind(reason)
        .bind(now_ms)
        .bind(&event_id)
        .bind(bid_id)
        .bind(status.as_str())
        .execute(&mut *tx)
        .await;

        match updated {
            Ok(result) if result.rows_affected() == 1 => {}
            Ok(_) => {
                rollback_quietly(tx, bid_id).await;
                warn!(bid_id, event_id = %event_id, "withdraw: status changed underneath the update");
                return false;
            }
            Err(err) => {
                error!(bid_id, event_id = %event_id, error = %err, "withdraw: failed to update bid");
                rollback_quietly(tx, bid_id).await;
                return false;
            }
        }

        if let Err(err) = tx.commit().await {
            error!(bid_id, event_id = %event_id, error = %err, "withdraw: failed to commit");
            return false;
        }

        metrics::counter!("dibs_bids_withdrawn_total", "marketplace" => marketplace).increment(1);
        info!(bid_id, event_id = %event_id, previous = %status, "bid withdrawn");
        true
    }

    /// Mark a pending bid as submitted to its marketplace.
    pub async fn mark_submitted(&self, bid_id: &str) -> BidResult<bool> {
        self.transition(bid_id, &[BidStatus::Pending], BidStatus::Submitted)
            .await
    }

    /// Mark a submitted bid as live on its marketplace.
    pub async fn mark_active(&self, bid_id: &str) -> BidResult<bool> {
        self.transition(bid_id, &[BidStatus::Submitted], BidStatus::Active)
            .await
    }

    /// Record that the marketplace awarded the opportunity to this bid.
    pub async fn mark_accepted(&self, bid_id: &str) -> BidResult<bool> {
        self.transition(bid_id, &[BidStatus::Active], BidStatus::Accepted)
            .await
    }

    /// Record that the marketplace declined this bid.
    pub async fn mark_rejected(&self, bid_id: &str) -> BidResult<bool> {
        self.transition(
            bid_id,
            &[BidStatus::Active, BidStatus::Submitted],
            BidStatus::Rejected,
        )
        .await
    }

    /// Record that the opportunity closed before a decision.
    pub async fn mark_expired(&self, bid_id: &str) -> BidResult<bool> {
        self.transition(
            bid_id,
            &[BidStatus::Active, BidStatus::Submitted, BidStatus::Pending],
            BidStatus::Expired,
        )
        .await
    }

    /// Move a bid between lifecycle statuses.
    ///
    /// Reads the current status under a transaction, refuses sources
    /// outside `allowed_from` with `Ok(false)`, and guards the update
    /// with the status it read. Every applied transition rotates the
    /// event id.
    async fn transition(
        &self,
        bid_id: &str,
        allowed_from: &[BidStatus],
        to: BidStatus,
    ) -> BidResult<bool> {
        let mut tx = self.store.pool().begin().await?;

        let row = sqlx::query(r#"SELECT status FROM bids WHERE id = ?1"#)
            .bind(bid_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Err(BidError::NotFound(bid_id.to_string()));
        };

        let status: BidStatus = row.get::<String, _>("status").parse()?;
        if !allowed_from.contains(&status) {
            tx.rollback().await?;
            debug!(bid_id, from = %status, to = %to, "transition skipped: source status not eligible");
            return Ok(false);
        }

        let result = sqlx::query(
            r#"UPDATE bids SET status = ?1, updated_at = ?2, event_id = ?3
               WHERE id = ?4 AND status = ?5"#,
        )
        .bind(to.as_str())
        .bind(now_epoch_ms())
        .bind(Ulid::new().to_string())
        .bind(bid_id)
        .bind(status.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        info!(bid_id, from = %status, to = %to, "bid status updated");
        Ok(true)
    }

    /// Flag redundant claims on an opportunity as `DUPLICATE`.
    ///
    /// Repair path for claims that bypassed placement, for example rows
    /// imported from another node that ran on its own local lock store.
    /// Keeps the accepted bid when one exists, otherwise the earliest
    /// claim, and flags the rest. Accepted bids are never flagged.
    ///
    /// ## Returns
    /// The number of bids flagged.
    #[instrument(skip(self))]
    pub async fn flag_duplicates(&self, marketplace: &str, opportunity: &str) -> BidResult<u64> {
        let mut tx = self.store.pool().begin().await?;

        let rows = sqlx::query(
            r#"SELECT id, status FROM bids
               WHERE marketplace = ?1 AND opportunity = ?2
                 AND status IN ('PENDING', 'SUBMITTED', 'ACTIVE', 'ACCEPTED')
               ORDER BY created_at ASC, id ASC"#,
        )
        .bind(marketplace)
        .bind(opportunity)
        .fetch_all(&mut *tx)
        .await?;

        let keeper = rows
            .iter()
            .position(|row| row.get::<String, _>("status") == BidStatus::Accepted.as_str())
            .unwrap_or(0);

        let mut flagged = 0u64;
        for (idx, row) in rows.iter().enumerate() {
            if idx == keeper {
                continue;
            }
            let status: String = row.get("status");
            if status == BidStatus::Accepted.as_str() {
                continue;
            }
            let id: String = row.get("id");
            let result = sqlx::query(
                r#"UPDATE bids SET status = 'DUPLICATE', updated_at = ?1, event_id = ?2
                   WHERE id = ?3 AND status = ?4"#,
            )
            .bind(now_epoch_ms())
            .bind(Ulid::new().to_string())
            .bind(&id)
            .bind(&status)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() > 0 {
                flagged += result.rows_affected();
                warn!(bid_id = %id, previous = %status, "redundant claim flagged as duplicate");
            }
        }

        tx.commit().await?;
        if flagged > 0 {
            metrics::counter!("dibs_bids_deduplicated_total", "marketplace" => marketplace.to_string())
                .increment(flagged);
            info!(marketplace, opportunity, flagged, "duplicate sweep finished");
        }
        Ok(flagged)
    }
}

async fn rollback_quietly(tx: Transaction<'_, Sqlite>, bid_id: &str) {
    if let Err(err) = tx.rollback().await {
        error!(bid_id, error = %err, "withdraw: rollback failed");
    }
}
