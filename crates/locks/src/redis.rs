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

//! Redis lock backend: the remote, multi-node provider.
//!
//! ## Purpose
//! Opportunity leases shared by every worker process, built on two
//! Redis primitives:
//! - acquire: `SET key holder NX PX ttl_ms` (atomic
//!   set-if-absent-with-expiry, server-side TTL)
//! - release: a Lua script that deletes the key only when its value
//!   still equals the caller's holder id, so a worker whose lease
//!   lapsed mid-flight cannot evict the next holder
//!
//! ## Design
//! - `ConnectionManager` handles pooling and reconnection; it is cloned
//!   per operation (a cheap handle, clones share one connection).
//! - The stored value is the bare holder id. No envelope, no JSON: the
//!   release script stays a string compare, and `get` reconstructs the
//!   expiry from `PTTL`.
//! - Keys are namespaced (`{namespace}:lease:{marketplace}#{opportunity}`)
//!   so several deployments can share one Redis.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{Client, RedisResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::backend::{Lease, LockBackend, LockKey};
use crate::error::{LockError, LockResult};
use crate::metrics::LockMetrics;

const BACKEND_NAME: &str = "redis";

/// Deletes the lease only when it is still owned by the caller.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed [`LockBackend`].
#[derive(Clone)]
pub struct RedisLockBackend {
    manager: ConnectionManager,
    namespace: String,
    metrics: Arc<LockMetrics>,
}

impl RedisLockBackend {
    /// Connect to Redis and build the backend.
    ///
    /// ## Arguments
    /// * `url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `namespace` - key prefix isolating this deployment's leases
    ///
    /// ## Errors
    /// - [`LockError::BackendError`]: connection establishment failed
    pub async fn connect(url: &str, namespace: &str) -> LockResult<Self> {
        let client = Client::open(url)
            .map_err(|e| LockError::BackendError(format!("failed to create redis client: {e}")))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| LockError::BackendError(format!("failed to connect redis: {e}")))?;

        Ok(Self {
            manager,
            namespace: namespace.to_string(),
            metrics: Arc::new(LockMetrics::new(BACKEND_NAME)),
        })
    }

    fn lease_key(&self, key: &LockKey) -> String {
        format!("{}:lease:{}", self.namespace, key.storage_key())
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    #[instrument(skip(self), fields(lock_key = %key, holder_id = %holder_id))]
    async fn try_acquire(
        &self,
        key: &LockKey,
        holder_id: &str,
        ttl: Duration,
    ) -> LockResult<bool> {
        self.metrics.record_attempt();
        let mut conn = self.manager.clone();
        let lease_key = self.lease_key(key);
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let reply: Option<String> = redis::cmd("SET")
            .arg(&lease_key)
            .arg(holder_id)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::BackendError(format!("Redis SET NX failed: {e}")))?;

        if reply.is_some() {
            self.metrics.record_success();
            debug!(ttl_ms, "lease acquired");
            Ok(true)
        } else {
            self.metrics.record_conflict();
            debug!("lease held by another worker");
            Ok(false)
        }
    }

    #[instrument(skip(self), fields(lock_key = %key, holder_id = %holder_id))]
    async fn release(&self, key: &LockKey, holder_id: &str) -> LockResult<bool> {
        let mut conn = self.manager.clone();
        let lease_key = self.lease_key(key);

        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&lease_key)
            .arg(holder_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::BackendError(format!("Redis release script failed: {e}")))?;

        Ok(deleted == 1)
    }

    async fn get(&self, key: &LockKey) -> LockResult<Option<Lease>> {
        let mut conn = self.manager.clone();
        let lease_key = self.lease_key(key);

        let (holder, pttl_ms): (Option<String>, i64) = redis::pipe()
            .get(&lease_key)
            .cmd("PTTL")
            .arg(&lease_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::BackendError(format!("Redis GET/PTTL failed: {e}")))?;

        // PTTL answers -2 for a missing key and -1 for one without
        // expiry; leases always carry one, so anything non-positive
        // means there is no live lease.
        match holder {
            Some(holder_id) if pttl_ms > 0 => Ok(Some(Lease {
                key: key.storage_key(),
                holder_id,
                acquired_at: None,
                expires_at: Utc::now() + chrono::Duration::milliseconds(pttl_ms),
            })),
            _ => Ok(None),
        }
    }

    async fn health_check(&self) -> bool {
        let mut conn = self.manager.clone();
        let reply: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        match reply {
            Ok(pong) => pong.eq_ignore_ascii_case("pong"),
            Err(e) => {
                warn!(error = %e, "redis lock backend health check failed");
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
