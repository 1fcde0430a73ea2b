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

//! Resource identity and per-store lock state.
//!
//! ## Purpose
//! A [`Key`] names the resource being locked and carries everything a store
//! needs to recognize this caller again: one fencing token per store
//! identity, plus a local expiry clock maintained by TTL-aware stores.
//!
//! ## Design
//! - **Token per store identity**: tokens are kept in a map keyed by a
//!   per-store-type constant, so a key can move between store types without
//!   its identities colliding, and without the key holding a reference back
//!   to any store.
//! - **Sticky-minimum deadline**: `reduce_lifetime` only ever moves the
//!   deadline earlier. Whichever layer (store default TTL, caller TTL) is
//!   more pessimistic wins.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Error as _, Serialize, SerializeStruct, Serializer};

use crate::error::{LockError, LockResult};

/// Maximum length of a resource identifier, in bytes.
///
/// Bounded by the most restrictive backends (MongoDB `_id`, ZooKeeper node
/// names).
pub const MAX_RESOURCE_LEN: usize = 1024;

/// Identifies a lockable resource and the caller's claim on it.
///
/// A key must not be used with two stores of different identities at the
/// same time; reuse across store types is fine sequentially after
/// [`Key::reset`].
#[derive(Debug, Clone)]
pub struct Key {
    resource: String,
    state: HashMap<String, String>,
    expires_at: Option<SystemTime>,
    serializable: bool,
}

impl Key {
    /// Creates a key for `resource`.
    ///
    /// Fails with [`LockError::InvalidArgument`] when the resource name is
    /// empty or exceeds [`MAX_RESOURCE_LEN`] bytes.
    pub fn new(resource: impl Into<String>) -> LockResult<Self> {
        let resource = resource.into();
        if resource.is_empty() {
            return Err(LockError::InvalidArgument(
                "resource name must not be empty".to_string(),
            ));
        }
        if resource.len() > MAX_RESOURCE_LEN {
            return Err(LockError::InvalidArgument(format!(
                "resource name must not exceed {MAX_RESOURCE_LEN} bytes, got {}",
                resource.len()
            )));
        }
        Ok(Self {
            resource,
            state: HashMap::new(),
            expires_at: None,
            serializable: true,
        })
    }

    /// The resource identifier this key stands for.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Returns the fencing token for `identity`, generating it on first use.
    ///
    /// 32 random bytes from the OS RNG, base64-encoded. The token is what
    /// lets a store prove this key (and nobody else) holds the resource, so
    /// it is generated once and then stays stable until [`Key::reset`].
    pub fn unique_token(&mut self, identity: &str) -> String {
        if let Some(token) = self.state.get(identity) {
            return token.clone();
        }
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);
        let token = STANDARD.encode(raw);
        self.state.insert(identity.to_string(), token.clone());
        token
    }

    /// The token previously issued for `identity`, if any.
    pub fn token(&self, identity: &str) -> Option<&str> {
        self.state.get(identity).map(String::as_str)
    }

    /// True when a token has been issued for `identity`.
    pub fn has_state(&self, identity: &str) -> bool {
        self.state.contains_key(identity)
    }

    /// Drops all per-store state, the expiry clock and the serializability
    /// restriction, returning the key to its freshly-constructed form.
    pub fn reset(&mut self) {
        self.state.clear();
        self.expires_at = None;
        self.serializable = true;
    }

    /// Moves the deadline to `now + ttl` unless the current deadline is
    /// already earlier. The deadline only ever moves backwards in time.
    pub fn reduce_lifetime(&mut self, ttl: Duration) {
        let candidate = SystemTime::now() + ttl;
        self.expires_at = Some(match self.expires_at {
            Some(current) if current < candidate => current,
            _ => candidate,
        });
    }

    /// Clears the deadline.
    pub fn reset_lifetime(&mut self) {
        self.expires_at = None;
    }

    /// True when a deadline is set and has elapsed.
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|deadline| deadline <= SystemTime::now())
    }

    /// Time left before the deadline, `None` when no deadline is set.
    pub fn remaining_lifetime(&self) -> Option<Duration> {
        self.expires_at.map(|deadline| {
            deadline
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO)
        })
    }

    /// Marks the key as bound to process-local identity (sessions, file
    /// descriptors). Serializing such a key fails loudly.
    pub fn mark_unserializable(&mut self) {
        self.serializable = false;
    }

    /// Whether this key can be moved across process boundaries.
    pub fn is_serializable(&self) -> bool {
        self.serializable
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resource)
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if !self.serializable {
            return Err(S::Error::custom(format!(
                "key \"{}\" holds process-local state and cannot be serialized",
                self.resource
            )));
        }
        let expires_at = self
            .expires_at
            .and_then(|deadline| deadline.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|since_epoch| since_epoch.as_secs_f64());
        let mut out = serializer.serialize_struct("Key", 3)?;
        out.serialize_field("resource", &self.resource)?;
        out.serialize_field("state", &self.state)?;
        out.serialize_field("expires_at", &expires_at)?;
        out.end()
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(serde::Deserialize)]
        struct Repr {
            resource: String,
            state: HashMap<String, String>,
            expires_at: Option<f64>,
        }

        let repr = Repr::deserialize(deserializer)?;
        let mut key = Key::new(repr.resource).map_err(serde::de::Error::custom)?;
        key.state = repr.state;
        key.expires_at = repr
            .expires_at
            .map(|since_epoch| SystemTime::UNIX_EPOCH + Duration::from_secs_f64(since_epoch));
        Ok(key)
    }
}
