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

//! In-memory lock backend (for testing and single-process use).

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::backend::{Lease, LockBackend, LockKey};
use crate::error::LockResult;
use crate::metrics::LockMetrics;

/// In-memory lock backend.
///
/// ## Purpose
/// A [`LockBackend`] over a process-local map, used as the test
/// substitute for the real providers and for single-process runs that
/// need the locking calls without any external store.
///
/// ## Limitations
/// - Not persistent (leases lost on restart)
/// - Not distributed (single process only)
/// - Expired leases linger until the key is touched again
pub struct MemoryLockBackend {
    leases: Arc<RwLock<HashMap<String, Lease>>>,
    metrics: LockMetrics,
}

impl MemoryLockBackend {
    /// Create an empty in-memory backend.
    pub fn new() -> Self {
        Self {
            leases: Arc::new(RwLock::new(HashMap::new())),
            metrics: LockMetrics::new("memory"),
        }
    }
}

impl Default for MemoryLockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn try_acquire(
        &self,
        key: &LockKey,
        holder_id: &str,
        ttl: Duration,
    ) -> LockResult<bool> {
        self.metrics.record_attempt();
        let mut leases = self.leases.write().await;
        let storage_key = key.storage_key();

        if let Some(existing) = leases.get(&storage_key) {
            if !existing.is_expired() {
                self.metrics.record_conflict();
                return Ok(false);
            }
        }

        let now = Utc::now();
        leases.insert(
            storage_key.clone(),
            Lease {
                key: storage_key,
                holder_id: holder_id.to_string(),
                acquired_at: Some(now),
                expires_at: now + chrono::Duration::milliseconds(ttl.as_millis() as i64),
            },
        );
        self.metrics.record_success();
        Ok(true)
    }

    async fn release(&self, key: &LockKey, holder_id: &str) -> LockResult<bool> {
        let mut leases = self.leases.write().await;
        let storage_key = key.storage_key();

        match leases.get(&storage_key) {
            Some(existing) if existing.holder_id == holder_id => {
                leases.remove(&storage_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &LockKey) -> LockResult<Option<Lease>> {
        let leases = self.leases.read().await;
        Ok(leases
            .get(&key.storage_key())
            .filter(|lease| !lease.is_expired())
            .cloned())
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn metrics(&self) -> &LockMetrics {
        &self.metrics
    }
}
