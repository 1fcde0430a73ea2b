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

//! Store contract and capability negotiation.
//!
//! ## Purpose
//! Defines the [`LockStore`] trait every backend implements and the
//! [`Capabilities`] set the [`Lock`](crate::Lock) coordinator uses to pick
//! between native blocking and polling fallback, and between shared and
//! exclusive acquisition.
//!
//! ## Contract
//! For every conforming store:
//! - `save` / `save_read` are idempotent for the same key: re-saving with
//!   the same fencing token succeeds (refreshing the hold). With a
//!   different token on a still-held resource they fail with
//!   [`LockError::Conflicted`].
//! - `delete` is a no-op when the caller is not the current holder; it must
//!   never release a lock owned by another token.
//! - `exists` is true iff the resource is currently held by *this* key's
//!   token, not merely by someone.
//! - `put_off_expiration` fails with [`LockError::Conflicted`] when the
//!   holder changed, otherwise extends the backend deadline by `ttl`.
//! - TTL-aware stores call [`check_not_expired`] after every successful
//!   `save` / `put_off_expiration` round trip.

use std::ops::BitOr;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{LockError, LockResult};
use crate::key::Key;

/// Capability set advertised by a store.
///
/// Each tier strictly extends the previous one: an `EXPIRING` store is also
/// `PERSISTING`, a `BLOCKING_SHARED` store is also `SHARED`, and so on. The
/// coordinator never invokes an operation the store did not advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    /// Exclusive write locks, non-blocking: `save`, `put_off_expiration`,
    /// `delete`, `exists`.
    pub const PERSISTING: Capabilities = Capabilities(1);
    /// The backend enforces TTLs and the store performs expiry checking in
    /// `save` / `put_off_expiration`.
    pub const EXPIRING: Capabilities = Capabilities(1 << 1);
    /// Read locks (many readers, one writer): `save_read`.
    pub const SHARED: Capabilities = Capabilities(1 << 2);
    /// Natively blocking exclusive acquisition: `wait_and_save`.
    pub const BLOCKING_EXCLUSIVE: Capabilities = Capabilities(1 << 3);
    /// Natively blocking shared acquisition: `wait_and_save_read`.
    pub const BLOCKING_SHARED: Capabilities = Capabilities(1 << 4);

    /// True when every capability in `other` is present in `self`.
    pub const fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}

/// A storage backend able to persist lock ownership.
///
/// Implementations advertise their capability set and may leave the
/// operations of tiers they do not support at the default bodies, which
/// fail with [`LockError::InvalidArgument`].
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Stable identity string scoping the per-key state this store writes.
    ///
    /// One constant per store type (not per instance), so a serialized key
    /// can be re-used against another instance of the same backend.
    fn identity(&self) -> &'static str;

    /// The capability set honored by this store.
    fn capabilities(&self) -> Capabilities;

    /// Stores the resource exclusively for `key`, failing with
    /// [`LockError::Conflicted`] when another token holds it.
    async fn save(&self, key: &mut Key) -> LockResult<()>;

    /// Acquires a read lock for stores advertising [`Capabilities::SHARED`].
    async fn save_read(&self, key: &mut Key) -> LockResult<()> {
        let _ = key;
        Err(LockError::InvalidArgument(format!(
            "{} store does not support shared locks",
            self.identity()
        )))
    }

    /// Blocks until the exclusive lock is acquired, for stores advertising
    /// [`Capabilities::BLOCKING_EXCLUSIVE`].
    async fn wait_and_save(&self, key: &mut Key) -> LockResult<()> {
        let _ = key;
        Err(LockError::InvalidArgument(format!(
            "{} store does not support blocking acquisition",
            self.identity()
        )))
    }

    /// Blocks until the read lock is acquired, for stores advertising
    /// [`Capabilities::BLOCKING_SHARED`].
    async fn wait_and_save_read(&self, key: &mut Key) -> LockResult<()> {
        let _ = key;
        Err(LockError::InvalidArgument(format!(
            "{} store does not support blocking shared acquisition",
            self.identity()
        )))
    }

    /// Extends the backend deadline by `ttl`, failing with
    /// [`LockError::Conflicted`] when the holder changed.
    async fn put_off_expiration(&self, key: &mut Key, ttl: Duration) -> LockResult<()>;

    /// Releases the hold identified by `key`'s token. A no-op when the
    /// caller is not the current holder.
    async fn delete(&self, key: &mut Key) -> LockResult<()>;

    /// True iff the resource is currently held by this key's token.
    async fn exists(&self, key: &Key) -> LockResult<bool>;
}

/// Fails with [`LockError::Expired`] when the key's local deadline elapsed.
///
/// TTL-aware stores call this after a successful backend write: a write
/// that lands once the deadline has already passed must be treated as lost,
/// because the backend may reap the entry at any moment.
pub fn check_not_expired(key: &Key) -> LockResult<()> {
    if key.is_expired() {
        return Err(LockError::Expired(key.resource().to_string()));
    }
    Ok(())
}

/// Fails with [`LockError::InvalidTtl`] on a zero TTL.
pub(crate) fn validate_ttl(ttl: Duration) -> LockResult<()> {
    if ttl.is_zero() {
        return Err(LockError::InvalidTtl("TTL must be positive".to_string()));
    }
    Ok(())
}

/// Delay between polling attempts when blocking must be emulated.
///
/// 100ms with ±10% jitter so contenders on a shared backend drift apart
/// instead of retrying in lockstep.
pub(crate) fn retry_delay() -> Duration {
    use rand::Rng;
    Duration::from_millis(rand::thread_rng().gen_range(90..=110))
}
