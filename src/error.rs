// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Distlock Contributors
//
// This file is part of distlock.
//
// distlock is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// distlock is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with distlock. If not, see <https://www.gnu.org/licenses/>.

//! Error types for lock operations.
//!
//! Every store and the [`Lock`](crate::Lock) coordinator share this single
//! taxonomy. [`LockError::Conflicted`] is the only *expected* steady-state
//! failure; everything else signals a configuration mistake or a backend
//! fault. Backend driver errors are converted into [`LockError::Storage`]
//! through the feature-gated `From` impls below, so the cause always
//! survives inside `Acquiring` / `Releasing` wrappers.

use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur during lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// Bad configuration: malformed DSN, missing database or collection,
    /// out-of-range option, oversized resource name.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A positive TTL was required but not provided.
    #[error("Invalid TTL: {0}")]
    InvalidTtl(String),

    /// The resource is held by another owner.
    #[error("Lock conflict: \"{0}\" is held by another owner")]
    Conflicted(String),

    /// Backend failure while acquiring or refreshing a lock.
    #[error("Failed to acquire lock \"{resource}\"")]
    Acquiring {
        resource: String,
        #[source]
        source: Box<LockError>,
    },

    /// Backend failure while releasing a lock, or the resource still
    /// appeared held after a release.
    #[error("Failed to release lock \"{resource}\"")]
    Releasing {
        resource: String,
        #[source]
        source: Box<LockError>,
    },

    /// Backend error (network, database, protocol).
    #[error("Lock storage error: {0}")]
    Storage(String),

    /// The key's local deadline elapsed before or right after a backend
    /// operation completed; the hold is no longer authoritative.
    #[error("Lock \"{0}\" expired before the operation completed")]
    Expired(String),
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::Storage(format!("Redis error: {err}"))
    }
}

#[cfg(feature = "memcached-backend")]
impl From<memcache::MemcacheError> for LockError {
    fn from(err: memcache::MemcacheError) -> Self {
        LockError::Storage(format!("Memcached error: {err}"))
    }
}

#[cfg(feature = "mongodb-backend")]
impl From<mongodb::error::Error> for LockError {
    fn from(err: mongodb::error::Error) -> Self {
        LockError::Storage(format!("MongoDB error: {err}"))
    }
}

#[cfg(feature = "postgres-backend")]
impl From<sqlx::Error> for LockError {
    fn from(err: sqlx::Error) -> Self {
        LockError::Storage(format!("PostgreSQL error: {err}"))
    }
}

#[cfg(feature = "zookeeper-backend")]
impl From<zookeeper_client::Error> for LockError {
    fn from(err: zookeeper_client::Error) -> Self {
        LockError::Storage(format!("ZooKeeper error: {err}"))
    }
}

#[cfg(feature = "flock-backend")]
impl From<std::io::Error> for LockError {
    fn from(err: std::io::Error) -> Self {
        LockError::Storage(format!("IO error: {err}"))
    }
}
