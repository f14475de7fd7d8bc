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

//! Configuration and backend selection for opportunity locks.
//!
//! ## Purpose
//! Environment-based configuration for choosing between the remote
//! (Redis) and local (SQLite) lock providers, and the factory that
//! builds a ready [`LockManager`] from it.
//!
//! ## Environment Variables
//!
//! ### Backend Selection
//! - `DIBS_LOCK_BACKEND`: Backend choice (default: "auto")
//!   - "remote" | "redis" → Redis provider, connection errors surface
//!   - "local" | "sqlite" → SQLite provider
//!   - "auto" → probe Redis; fall back to SQLite with a warning
//!
//! ### Remote (Redis) Configuration
//! - `DIBS_LOCK_REDIS_URL`: Redis server URL (default: "redis://localhost:6379")
//! - `DIBS_LOCK_NAMESPACE`: key prefix for isolation (default: "dibs")
//!
//! ### Local (SQLite) Configuration
//! - `DIBS_LOCK_SQLITE_PATH`: database file path (default: "dibs-locks.db")
//!
//! ### Lease Behavior
//! - `DIBS_LOCK_TTL_SECS`: lease TTL in whole seconds (default: 60)
//! - `DIBS_LOCK_ACQUIRE_TIMEOUT_SECS`: acquire deadline in seconds,
//!   fractions allowed (default: 5.0)
//!
//! ## Examples
//!
//! ### Auto (default)
//! ```bash
//! # Probes Redis at the default URL, falls back to local SQLite
//! cargo run
//! ```
//!
//! ### Explicit remote
//! ```bash
//! export DIBS_LOCK_BACKEND=remote
//! export DIBS_LOCK_REDIS_URL=redis://cache.internal:6379
//! cargo run
//! ```
//!
//! ### Explicit local
//! ```bash
//! export DIBS_LOCK_BACKEND=local
//! export DIBS_LOCK_SQLITE_PATH=/var/lib/dibs/locks.db
//! cargo run
//! ```

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{LockError, LockResult};
use crate::manager::LockManager;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_SQLITE_PATH: &str = "dibs-locks.db";
pub const DEFAULT_NAMESPACE: &str = "dibs";
pub const DEFAULT_TTL_SECS: u64 = 60;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: f64 = 5.0;

/// Which lease provider the factory builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBackendKind {
    /// Redis: shared by all workers on all nodes
    Remote,
    /// SQLite: single-node fallback
    Local,
    /// Probe remote, fall back to local
    Auto,
}

impl FromStr for LockBackendKind {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "remote" | "redis" => Ok(LockBackendKind::Remote),
            "local" | "sqlite" => Ok(LockBackendKind::Local),
            "auto" => Ok(LockBackendKind::Auto),
            other => Err(LockError::ConfigError(format!(
                "Unknown lock backend: {}. Valid options: remote, local, auto",
                other
            ))),
        }
    }
}

impl std::fmt::Display for LockBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockBackendKind::Remote => write!(f, "remote"),
            LockBackendKind::Local => write!(f, "local"),
            LockBackendKind::Auto => write!(f, "auto"),
        }
    }
}

/// Lock subsystem configuration.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Provider choice
    pub backend: LockBackendKind,
    /// Redis server URL (remote provider)
    pub redis_url: String,
    /// Lease key prefix (remote provider)
    pub namespace: String,
    /// SQLite database file path (local provider)
    pub sqlite_path: String,
    /// Lease TTL; the sole crash-recovery mechanism, so it must exceed
    /// the longest expected hold
    pub ttl: Duration,
    /// How long an acquire keeps retrying before reporting failure
    pub acquire_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackendKind::Auto,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            sqlite_path: DEFAULT_SQLITE_PATH.to_string(),
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            acquire_timeout: Duration::from_secs_f64(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

impl LockConfig {
    /// Create configuration from environment variables.
    ///
    /// ## Environment Variables
    /// See module documentation for the complete list.
    pub fn from_env() -> LockResult<Self> {
        let backend = match std::env::var("DIBS_LOCK_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) => LockBackendKind::Auto,
        };

        let redis_url = std::env::var("DIBS_LOCK_REDIS_URL")
            .unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());
        let namespace = std::env::var("DIBS_LOCK_NAMESPACE")
            .unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        let sqlite_path = std::env::var("DIBS_LOCK_SQLITE_PATH")
            .unwrap_or_else(|_| DEFAULT_SQLITE_PATH.to_string());

        let ttl_secs = match std::env::var("DIBS_LOCK_TTL_SECS") {
            Ok(value) => value.parse::<u64>().map_err(|_| {
                LockError::ConfigError(format!(
                    "DIBS_LOCK_TTL_SECS must be a whole number of seconds, got: {}",
                    value
                ))
            })?,
            Err(_) => DEFAULT_TTL_SECS,
        };
        if ttl_secs == 0 {
            return Err(LockError::ConfigError(
                "DIBS_LOCK_TTL_SECS must be positive; a zero TTL would expire leases immediately"
                    .to_string(),
            ));
        }

        let acquire_timeout_secs = match std::env::var("DIBS_LOCK_ACQUIRE_TIMEOUT_SECS") {
            Ok(value) => {
                let parsed = value.parse::<f64>().map_err(|_| {
                    LockError::ConfigError(format!(
                        "DIBS_LOCK_ACQUIRE_TIMEOUT_SECS must be a number of seconds, got: {}",
                        value
                    ))
                })?;
                if !parsed.is_finite() || parsed < 0.0 {
                    return Err(LockError::ConfigError(format!(
                        "DIBS_LOCK_ACQUIRE_TIMEOUT_SECS must be a non-negative finite number, got: {}",
                        value
                    )));
                }
                parsed
            }
            Err(_) => DEFAULT_ACQUIRE_TIMEOUT_SECS,
        };

        Ok(Self {
            backend,
            redis_url,
            namespace,
            sqlite_path,
            ttl: Duration::from_secs(ttl_secs),
            acquire_timeout: Duration::from_secs_f64(acquire_timeout_secs),
        })
    }
}

/// Build a [`LockManager`] from environment configuration.
pub async fn create_lock_manager_from_env() -> LockResult<LockManager> {
    let config = LockConfig::from_env()?;
    create_lock_manager(&config).await
}

/// Build a [`LockManager`] from explicit configuration.
///
/// ## Selection
/// - `Remote`: connect and probe Redis; any failure surfaces (the
///   operator asked for remote explicitly)
/// - `Local`: open the SQLite lease store
/// - `Auto`: try remote first; on any failure log a warning and fall
///   back to local, so one node keeps bidding while Redis is down
pub async fn create_lock_manager(config: &LockConfig) -> LockResult<LockManager> {
    match config.backend {
        LockBackendKind::Remote => connect_remote(config).await,
        LockBackendKind::Local => open_local(config).await,
        LockBackendKind::Auto => match connect_remote(config).await {
            Ok(manager) => Ok(manager),
            Err(e) => {
                warn!(
                    url = %config.redis_url,
                    error = %e,
                    "remote lock backend unavailable, falling back to local"
                );
                open_local(config).await
            }
        },
    }
}

#[cfg(feature = "redis-backend")]
async fn connect_remote(config: &LockConfig) -> LockResult<LockManager> {
    use crate::redis::RedisLockBackend;
    use crate::backend::LockBackend;

    let backend = RedisLockBackend::connect(&config.redis_url, &config.namespace).await?;
    if !backend.health_check().await {
        return Err(LockError::BackendError(format!(
            "redis at {} failed health check",
            config.redis_url
        )));
    }
    info!(url = %config.redis_url, "lock backend selected: remote (redis)");
    Ok(LockManager::new(
        Arc::new(backend),
        config.ttl,
        config.acquire_timeout,
    ))
}

#[cfg(not(feature = "redis-backend"))]
async fn connect_remote(_config: &LockConfig) -> LockResult<LockManager> {
    Err(LockError::ConfigError(
        "Remote lock backend requires 'redis-backend' feature".to_string(),
    ))
}

#[cfg(feature = "sqlite-backend")]
async fn open_local(config: &LockConfig) -> LockResult<LockManager> {
    use crate::sql::SqliteLockBackend;

    let database_url = format!("sqlite:{}?mode=rwc", config.sqlite_path);
    let backend = SqliteLockBackend::new(&database_url).await?;
    info!(path = %config.sqlite_path, "lock backend selected: local (sqlite)");
    Ok(LockManager::new(
        Arc::new(backend),
        config.ttl,
        config.acquire_timeout,
    ))
}

#[cfg(not(feature = "sqlite-backend"))]
async fn open_local(_config: &LockConfig) -> LockResult<LockManager> {
    Err(LockError::ConfigError(
        "Local lock backend requires 'sqlite-backend' feature".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_lock_env() {
        std::env::remove_var("DIBS_LOCK_BACKEND");
        std::env::remove_var("DIBS_LOCK_REDIS_URL");
        std::env::remove_var("DIBS_LOCK_NAMESPACE");
        std::env::remove_var("DIBS_LOCK_SQLITE_PATH");
        std::env::remove_var("DIBS_LOCK_TTL_SECS");
        std::env::remove_var("DIBS_LOCK_ACQUIRE_TIMEOUT_SECS");
    }

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("remote".parse::<LockBackendKind>().unwrap(), LockBackendKind::Remote);
        assert_eq!("redis".parse::<LockBackendKind>().unwrap(), LockBackendKind::Remote);
        assert_eq!("local".parse::<LockBackendKind>().unwrap(), LockBackendKind::Local);
        assert_eq!("sqlite".parse::<LockBackendKind>().unwrap(), LockBackendKind::Local);
        assert_eq!("AUTO".parse::<LockBackendKind>().unwrap(), LockBackendKind::Auto);
        assert!(matches!(
            "zookeeper".parse::<LockBackendKind>(),
            Err(LockError::ConfigError(_))
        ));
    }

    #[test]
    #[serial]
    fn test_config_from_env_defaults() {
        clear_lock_env();

        let config = LockConfig::from_env().unwrap();
        assert_eq!(config.backend, LockBackendKind::Auto);
        assert_eq!(config.redis_url, DEFAULT_REDIS_URL);
        assert_eq!(config.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.sqlite_path, DEFAULT_SQLITE_PATH);
        assert_eq!(config.ttl, Duration::from_secs(DEFAULT_TTL_SECS));
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
    }

    #[test]
    #[serial]
    fn test_config_from_env_explicit_values() {
        clear_lock_env();
        std::env::set_var("DIBS_LOCK_BACKEND", "local");
        std::env::set_var("DIBS_LOCK_SQLITE_PATH", "/tmp/dibs-test-locks.db");
        std::env::set_var("DIBS_LOCK_TTL_SECS", "120");
        std::env::set_var("DIBS_LOCK_ACQUIRE_TIMEOUT_SECS", "2.5");

        let config = LockConfig::from_env().unwrap();
        assert_eq!(config.backend, LockBackendKind::Local);
        assert_eq!(config.sqlite_path, "/tmp/dibs-test-locks.db");
        assert_eq!(config.ttl, Duration::from_secs(120));
        assert_eq!(config.acquire_timeout, Duration::from_millis(2500));

        clear_lock_env();
    }

    #[test]
    #[serial]
    fn test_config_from_env_rejects_bad_values() {
        clear_lock_env();

        std::env::set_var("DIBS_LOCK_BACKEND", "zookeeper");
        assert!(LockConfig::from_env().is_err());

        std::env::set_var("DIBS_LOCK_BACKEND", "auto");
        std::env::set_var("DIBS_LOCK_TTL_SECS", "soon");
        assert!(LockConfig::from_env().is_err());

        std::env::set_var("DIBS_LOCK_TTL_SECS", "0");
        assert!(LockConfig::from_env().is_err());

        std::env::remove_var("DIBS_LOCK_TTL_SECS");
        std::env::set_var("DIBS_LOCK_ACQUIRE_TIMEOUT_SECS", "-1");
        assert!(LockConfig::from_env().is_err());

        clear_lock_env();
    }

    #[cfg(feature = "sqlite-backend")]
    #[tokio::test]
    #[serial]
    async fn test_factory_builds_local_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = LockConfig {
            backend: LockBackendKind::Local,
            sqlite_path: dir.path().join("locks.db").display().to_string(),
            ..LockConfig::default()
        };

        let manager = create_lock_manager(&config).await.unwrap();
        assert_eq!(manager.backend_name(), "sqlite");
        assert!(manager.health_check().await);
    }

    #[cfg(all(feature = "redis-backend", feature = "sqlite-backend"))]
    #[tokio::test]
    #[serial]
    async fn test_auto_falls_back_when_remote_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let config = LockConfig {
            backend: LockBackendKind::Auto,
            // Nothing listens here; connect fails fast.
            redis_url: "redis://127.0.0.1:1".to_string(),
            sqlite_path: dir.path().join("locks.db").display().to_string(),
            ..LockConfig::default()
        };

        let manager = create_lock_manager(&config).await.unwrap();
        assert_eq!(manager.backend_name(), "sqlite");
    }

    #[cfg(feature = "redis-backend")]
    #[tokio::test]
    #[serial]
    async fn test_explicit_remote_surfaces_connection_error() {
        let config = LockConfig {
            backend: LockBackendKind::Remote,
            redis_url: "redis://127.0.0.1:1".to_string(),
            ..LockConfig::default()
        };

        assert!(matches!(
            create_lock_manager(&config).await,
            Err(LockError::BackendError(_))
        ));
    }
}
