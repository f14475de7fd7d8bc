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

//! SQLite lock backend: the single-node local fallback.
//!
//! ## Purpose
//! Keeps workers on one node coordinated when the remote provider is
//! unreachable. Leases live in a single `leases` table whose primary
//! key is the set-if-absent mechanism: the INSERT either lands or hits
//! the uniqueness constraint.
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS leases (
//!   lock_key    TEXT PRIMARY KEY,
//!   holder_id   TEXT NOT NULL,
//!   acquired_at INTEGER NOT NULL,
//!   expires_at  INTEGER NOT NULL
//! );
//! ```
//!
//! - timestamps are UNIX epoch milliseconds (sub-second TTLs must
//!   round-trip exactly)
//! - expired rows are reaped opportunistically before each insert; the
//!   reap and the insert are deliberately separate statements, and the
//!   primary key stays the source of truth if another worker slips in
//!   between them
//!
//! ## Limitations
//! Mutual exclusion holds per database file. Two processes configured
//! with different paths each get their own lock space and can both
//! "hold" the same logical key. Single-node use only; the remote
//! backend is the multi-node answer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::backend::{Lease, LockBackend, LockKey};
use crate::error::{LockError, LockResult};
use crate::metrics::LockMetrics;

const BACKEND_NAME: &str = "sqlite";

/// SQLite-backed [`LockBackend`].
#[derive(Clone)]
pub struct SqliteLockBackend {
    pool: SqlitePool,
    metrics: std::sync::Arc<LockMetrics>,
}

impl SqliteLockBackend {
    /// Create a new SQLite lock backend.
    ///
    /// `database_url` is any valid `sqlx` SQLite URL, e.g.:
    /// - `sqlite::memory:` (in-memory)
    /// - `sqlite:dibs-locks.db?mode=rwc` (file, created if missing)
    #[instrument(skip(database_url))]
    pub async fn new(database_url: &str) -> LockResult<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| LockError::BackendError(format!("failed to connect SQLite: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS leases (
              lock_key TEXT PRIMARY KEY,
              holder_id TEXT NOT NULL,
              acquired_at INTEGER NOT NULL,
              expires_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| LockError::BackendError(format!("failed to create leases table: {e}")))?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS idx_leases_expires_at ON leases(expires_at);"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| LockError::BackendError(format!("failed to create index: {e}")))?;

        Ok(Self {
            pool,
            metrics: std::sync::Arc::new(LockMetrics::new(BACKEND_NAME)),
        })
    }

    fn now_epoch_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn lease_from_row(row: &sqlx::sqlite::SqliteRow) -> Lease {
        let acquired_ms: i64 = row.get("acquired_at");
        let expires_ms: i64 = row.get("expires_at");
        Lease {
            key: row.get("lock_key"),
            holder_id: row.get("holder_id"),
            acquired_at: DateTime::<Utc>::from_timestamp_millis(acquired_ms),
            // An out-of-range value can only mean a corrupted row; treat
            // it as long expired rather than failing the read.
            expires_at: DateTime::<Utc>::from_timestamp_millis(expires_ms)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        }
    }
}

#[async_trait]
impl LockBackend for SqliteLockBackend {
    #[instrument(skip(self), fields(lock_key = %key, holder_id = %holder_id))]
    async fn try_acquire(
        &self,
        key: &LockKey,
        holder_id: &str,
        ttl: Duration,
    ) -> LockResult<bool> {
        self.metrics.record_attempt();
        let storage_key = key.storage_key();
        let now = Self::now_epoch_ms();

        // Reap lapsed leases so the primary-key slot frees up.
        sqlx::query(r#"DELETE FROM leases WHERE expires_at <= ?1"#)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::BackendError(format!("reap expired leases: {e}")))?;

        let expires_at = now + ttl.as_millis() as i64;
        let inserted = sqlx::query(
            r#"INSERT INTO leases (lock_key, holder_id, acquired_at, expires_at)
               VALUES (?1, ?2, ?3, ?4)"#,
        )
        .bind(&storage_key)
        .bind(holder_id)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {
                self.metrics.record_success();
                debug!(expires_at, "lease acquired");
                Ok(true)
            }
            Err(e) if is_unique_violation(&e) => {
                self.metrics.record_conflict();
                debug!("lease held by another worker");
                Ok(false)
            }
            Err(e) => Err(LockError::BackendError(format!("insert lease: {e}"))),
        }
    }

    #[instrument(skip(self), fields(lock_key = %key, holder_id = %holder_id))]
    async fn release(&self, key: &LockKey, holder_id: &str) -> LockResult<bool> {
        let result = sqlx::query(
            r#"DELETE FROM leases WHERE lock_key = ?1 AND holder_id = ?2"#,
        )
        .bind(key.storage_key())
        .bind(holder_id)
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::BackendError(format!("delete lease: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, key: &LockKey) -> LockResult<Option<Lease>> {
        let row = sqlx::query(
            r#"SELECT lock_key, holder_id, acquired_at, expires_at
               FROM leases WHERE lock_key = ?1 AND expires_at > ?2"#,
        )
        .bind(key.storage_key())
        .bind(Self::now_epoch_ms())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LockError::BackendError(format!("select lease: {e}")))?;

        Ok(row.as_ref().map(Self::lease_from_row))
    }

    async fn health_check(&self) -> bool {
        match sqlx::query(r#"SELECT 1"#).execute(&self.pool).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "sqlite lock backend health check failed");
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn metrics(&self) -> &LockMetrics {
        &self.metrics
    }
}

/// True when the error is the uniqueness constraint rejecting a second
/// lease on a held key.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
    )
}
