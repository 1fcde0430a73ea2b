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

//! # distlock: distributed mutual exclusion
//!
//! ## Purpose
//! A uniform lock abstraction over pluggable storage backends. A [`Key`]
//! names the resource and carries fencing tokens; a [`Lock`] handle drives
//! acquisition, refresh and release against any [`LockStore`]; capability
//! negotiation gives weaker backends graceful fallbacks (polling instead of
//! native blocking, write locks instead of read locks).
//!
//! ## Design Decisions
//! - **Fencing tokens**: every hold is tagged with 32 random bytes, so
//!   refresh and release can prove ownership and a stale handle can never
//!   release somebody else's lock.
//! - **Capability tiers**: persisting → expiring → shared → blocking.
//!   Stores advertise what they honor; the coordinator never calls an
//!   operation that was not advertised.
//! - **Local expiry clock**: TTL-aware stores keep a sticky-minimum
//!   deadline on the key, and an acquisition that outlives its own
//!   deadline is judged lost and compensated.
//!
//! ## Backend Support
//!
//! - **InMemory**: single process, also the intra-process guard for the
//!   PostgreSQL store (feature: `memory-backend`, default)
//! - **Redis**: `SET NX PX` plus Lua-guarded sorted sets for read locks
//!   (feature: `redis-backend`)
//! - **Memcached**: `ADD` / CAS with extend-then-delete release
//!   (feature: `memcached-backend`)
//! - **MongoDB**: one document per resource, TTL-index reaping
//!   (feature: `mongodb-backend`)
//! - **PostgreSQL**: advisory locks, natively blocking, shared mode
//!   (feature: `postgres-backend`)
//! - **ZooKeeper**: ephemeral nodes, session-lifetime holds
//!   (feature: `zookeeper-backend`)
//! - **Flock**: OS file locks for single-machine coordination
//!   (feature: `flock-backend`)
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use distlock::{Key, Lock, memory::InMemoryStore};
//!
//! # async fn example() -> Result<(), distlock::LockError> {
//! let store = Arc::new(InMemoryStore::new());
//! let key = Key::new("reports/nightly")?;
//! let mut lock = Lock::with_options(key, store, Some(Duration::from_secs(30)), true)?;
//!
//! if lock.acquire(false).await? {
//!     // do the work only one holder may do, refreshing as needed:
//!     lock.refresh(None).await?;
//!     lock.release().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod key;
pub mod lock;
pub mod store;

#[cfg(feature = "memory-backend")]
pub mod memory;

#[cfg(feature = "flock-backend")]
pub mod flock;

#[cfg(feature = "memcached-backend")]
pub mod memcached;

#[cfg(feature = "mongodb-backend")]
pub mod mongodb;

#[cfg(feature = "postgres-backend")]
pub mod postgres;

#[cfg(feature = "redis-backend")]
pub mod redis;

#[cfg(feature = "zookeeper-backend")]
pub mod zookeeper;

pub use error::{LockError, LockResult};
pub use key::Key;
pub use lock::Lock;
pub use store::{Capabilities, LockStore};
