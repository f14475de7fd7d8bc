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

//! Error types for opportunity lease operations.

use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur during lock operations.
///
/// Contention is not an error: a lost race surfaces as `Ok(false)` from
/// `try_acquire`, and an exhausted deadline surfaces as a plain `false`
/// from the retrying acquire. Only storage, network, and configuration
/// failures use this type.
#[derive(Error, Debug)]
pub enum LockError {
    /// Backend error (database, network, etc.)
    #[error("Backend error: {0}")]
    BackendError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

#[cfg(feature = "sqlite-backend")]
impl From<sqlx::Error> for LockError {
    fn from(err: sqlx::Error) -> Self {
        LockError::BackendError(format!("SQL error: {}", err))
    }
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::BackendError(format!("Redis error: {}", err))
    }
}
