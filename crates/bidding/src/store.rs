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

//! SQLite-backed bid storage.
//!
//! ## Purpose
//! Persists bid records and enforces the storage half of the dedup
//! guarantee. The opportunity lock serializes well-behaved workers;
//! the partial unique index below rejects whatever slips past it.
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS bids (
//!   id                TEXT PRIMARY KEY,
//!   marketplace       TEXT NOT NULL,
//!   opportunity       TEXT NOT NULL,
//!   status            TEXT NOT NULL,
//!   amount_cents      INTEGER NOT NULL,
//!   currency          TEXT NOT NULL,
//!   proposal          TEXT NOT NULL,
//!   placed_by         TEXT NOT NULL,
//!   event_id          TEXT NOT NULL,
//!   created_at        INTEGER NOT NULL,
//!   updated_at        INTEGER NOT NULL,
//!   withdrawal_reason TEXT,
//!   withdrawn_at      INTEGER
//! );
//! ```
//!
//! - timestamps are UNIX epoch milliseconds
//! - the pool holds a single connection, so every write on this handle
//!   is serialized; WAL and a busy timeout cover other processes on
//!   the same file

use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool};
use tracing::{info, instrument};

use crate::error::{BidError, BidResult};
use crate::model::{Bid, BidStatus};

pub(crate) const INSERT_BID: &str = r#"INSERT INTO bids
  (id, marketplace, opportunity, status, amount_cents, currency, proposal,
   placed_by, event_id, created_at, updated_at, withdrawal_reason, withdrawn_at)
  VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"#;

/// SQLite bid store.
#[derive(Clone)]
pub struct BidStore {
    pool: SqlitePool,
}

impl BidStore {
    /// Open (and if needed create) the bid database.
    ///
    /// `database_url` is any valid `sqlx` SQLite URL, e.g.:
    /// - `sqlite::memory:` (in-memory)
    /// - `sqlite:dibs-bids.db?mode=rwc` (file, created if missing)
    ///
    /// ## Errors
    /// Returns [`BidError::Storage`] when the database cannot be opened
    /// or the schema cannot be applied.
    #[instrument(skip(database_url))]
    pub async fn open(database_url: &str) -> BidResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;

        // WAL keeps readers in other processes unblocked while this one
        // writes; the busy timeout covers cross-process write contention.
        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout=5000").execute(&pool).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bids (
              id TEXT PRIMARY KEY,
              marketplace TEXT NOT NULL,
              opportunity TEXT NOT NULL,
              status TEXT NOT NULL,
              amount_cents INTEGER NOT NULL,
              currency TEXT NOT NULL,
              proposal TEXT NOT NULL,
              placed_by TEXT NOT NULL,
              event_id TEXT NOT NULL,
              created_at INTEGER NOT NULL,
              updated_at INTEGER NOT NULL,
              withdrawal_reason TEXT,
              withdrawn_at INTEGER
            );
        "#,
        )
        .execute(&pool)
        .await?;

        // Second line of defense behind the opportunity lock: at most
        // one open claim per (marketplace, opportunity). ACCEPTED is
        // terminal and sits outside the index; the duplicate sweep
        // clears claims that pile up behind a winner.
        sqlx::query(
            r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_bids_open_claim
               ON bids(marketplace, opportunity)
               WHERE status IN ('PENDING', 'SUBMITTED', 'ACTIVE')"#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS idx_bids_opportunity
               ON bids(marketplace, opportunity)"#,
        )
        .execute(&pool)
        .await?;

        info!("bid store ready");
        Ok(Self { pool })
    }

    /// Fetch a bid by id.
    pub async fn get(&self, bid_id: &str) -> BidResult<Option<Bid>> {
        let row = sqlx::query(
            r#"SELECT id, marketplace, opportunity, status, amount_cents, currency, proposal,
                      placed_by, event_id, created_at, updated_at, withdrawal_reason, withdrawn_at
               FROM bids WHERE id = ?1"#,
        )
        .bind(bid_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_bid).transpose()
    }

    /// Fetch the bid currently claiming an opportunity, if any.
    ///
    /// A claim is any bid in `PENDING`, `SUBMITTED`, `ACTIVE`, or
    /// `ACCEPTED`. Withdrawn, rejected, expired, and duplicate bids do
    /// not block a fresh placement.
    pub async fn find_active(&self, marketplace: &str, opportunity: &str) -> BidResult<Option<Bid>> {
        let row = sqlx::query(
            r#"SELECT id, marketplace, opportunity, status, amount_cents, currency, proposal,
                      placed_by, event_id, created_at, updated_at, withdrawal_reason, withdrawn_at
               FROM bids
               WHERE marketplace = ?1 AND opportunity = ?2
                 AND status IN ('PENDING', 'SUBMITTED', 'ACTIVE', 'ACCEPTED')
               ORDER BY created_at ASC, id ASC
               LIMIT 1"#,
        )
        .bind(marketplace)
        .bind(opportunity)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_bid).transpose()
    }

    /// List every bid ever placed on an opportunity, oldest first.
    pub async fn list_for_opportunity(
        &self,
        marketplace: &str,
        opportunity: &str,
    ) -> BidResult<Vec<Bid>> {
        let rows = sqlx::query(
            r#"SELECT id, marketplace, opportunity, status, amount_cents, currency, proposal,
                      placed_by, event_id, created_at, updated_at, withdrawal_reason, withdrawn_at
               FROM bids
               WHERE marketplace = ?1 AND opportunity = ?2
               ORDER BY created_at ASC, id ASC"#,
        )
        .bind(marketplace)
        .bind(opportunity)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_bid).collect()
    }

    /// Insert a bid row as-is.
    ///
    /// Low-level escape hatch; placement should go through
    /// [`crate::BidCoordinator::create_if_absent`], which also checks
    /// for an existing claim before writing.
    ///
    /// ## Errors
    /// Returns [`BidError::DuplicateBid`] when the open-claim index
    /// rejects the row.
    pub async fn insert(&self, bid: &Bid) -> BidResult<()> {
        match bind_bid(sqlx::query(INSERT_BID), bid).execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(BidError::DuplicateBid {
                marketplace: bid.marketplace.clone(),
                opportunity: bid.opportunity.clone(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// The underlying pool, for callers that compose bid updates with
    /// their own statements in one transaction.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub(crate) fn now_epoch_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current time truncated to the millisecond precision the store keeps,
/// so a freshly built [`Bid`] compares equal to its stored row.
pub(crate) fn now_utc_ms() -> DateTime<Utc> {
    let now = Utc::now();
    now - chrono::Duration::nanoseconds(i64::from(now.timestamp_subsec_nanos() % 1_000_000))
}

/// Bind all thirteen bid columns in [`INSERT_BID`] order.
pub(crate) fn bind_bid<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    bid: &'q Bid,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    query
        .bind(&bid.id)
        .bind(&bid.marketplace)
        .bind(&bid.opportunity)
        .bind(bid.status.as_str())
        .bind(bid.amount_cents)
        .bind(&bid.currency)
        .bind(&bid.proposal)
        .bind(&bid.placed_by)
        .bind(&bid.event_id)
        .bind(bid.created_at.timestamp_millis())
        .bind(bid.updated_at.timestamp_millis())
        .bind(bid.withdrawal_reason.as_deref())
        .bind(bid.withdrawn_at.map(|t| t.timestamp_millis()))
}

pub(crate) fn row_to_bid(row: &SqliteRow) -> BidResult<Bid> {
    let status: String = row.get("status");
    let created_ms: i64 = row.get("created_at");
    let updated_ms: i64 = row.get("updated_at");
    let withdrawn_ms: Option<i64> = row.get("withdrawn_at");

    Ok(Bid {
        id: row.get("id"),
        marketplace: row.get("marketplace"),
        opportunity: row.get("opportunity"),
        status: status.parse()?,
        amount_cents: row.get("amount_cents"),
        currency: row.get("currency"),
        proposal: row.get("proposal"),
        placed_by: row.get("placed_by"),
        event_id: row.get("event_id"),
        // An out-of-range value can only mean a corrupted row; surface
        // the record with a floor timestamp rather than failing the read.
        created_at: DateTime::<Utc>::from_timestamp_millis(created_ms)
            .unwrap_or(DateTime::<Utc>::MIN_UTC),
        updated_at: DateTime::<Utc>::from_timestamp_millis(updated_ms)
            .unwrap_or(DateTime::<Utc>::MIN_UTC),
        withdrawal_reason: row.get("withdrawal_reason"),
        withdrawn_at: withdrawn_ms.and_then(DateTime::<Utc>::from_timestamp_millis),
    })
}

/// True when the error is the open-claim index rejecting a second bid
/// on a claimed opportunity.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
    )
}
