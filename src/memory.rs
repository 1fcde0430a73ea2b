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

//! In-memory lock store.
//!
//! ## Purpose
//! Single-process store for tests and intra-process coordination. It also
//! backs the [`PostgresStore`](crate::postgres::PostgresStore) as the guard
//! that serializes contenders sharing one database connection.
//!
//! ## Limitations
//! - Not persistent (holds are lost on restart)
//! - Not distributed (single process only)
//! - Expiry is checked lazily on access; a dead entry lingers until the
//!   next operation touches it

use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{LockError, LockResult};
use crate::key::Key;
use crate::store::{Capabilities, LockStore};

const IDENTITY: &str = "in_memory";

#[derive(Debug, Default)]
struct Entry {
    writer: Option<String>,
    readers: HashSet<String>,
    expires_at: Option<SystemTime>,
}

impl Entry {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }

    fn held_by(&self, token: &str) -> bool {
        self.writer.as_deref() == Some(token) || self.readers.contains(token)
    }

    /// Free for exclusive use by `token`: nobody else holds it in either
    /// mode.
    fn is_free_for(&self, token: &str) -> bool {
        (self.writer.is_none() || self.writer.as_deref() == Some(token))
            && self.readers.iter().all(|reader| reader == token)
    }
}

/// In-memory lock store (single mutex over a resource map).
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for InMemoryStore {
    fn identity(&self) -> &'static str {
        IDENTITY
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::PERSISTING | Capabilities::SHARED
    }

    async fn save(&self, key: &mut Key) -> LockResult<()> {
        let token = key.unique_token(IDENTITY);
        let mut entries = self.entries.lock().await;
        let now = SystemTime::now();
        let entry = entries.entry(key.resource().to_string()).or_default();
        if entry.is_expired(now) {
            *entry = Entry::default();
        }
        if !entry.is_free_for(&token) {
            return Err(LockError::Conflicted(key.resource().to_string()));
        }
        // promotion: our own read-side hold is replaced by the write hold
        entry.readers.remove(&token);
        entry.writer = Some(token);
        Ok(())
    }

    async fn save_read(&self, key: &mut Key) -> LockResult<()> {
        let token = key.unique_token(IDENTITY);
        let mut entries = self.entries.lock().await;
        let now = SystemTime::now();
        let entry = entries.entry(key.resource().to_string()).or_default();
        if entry.is_expired(now) {
            *entry = Entry::default();
        }
        match entry.writer.as_deref() {
            Some(writer) if writer != token => {
                return Err(LockError::Conflicted(key.resource().to_string()));
            }
            // demotion: the write hold becomes a read hold
            Some(_) => entry.writer = None,
            None => {}
        }
        entry.readers.insert(token);
        Ok(())
    }

    async fn put_off_expiration(&self, key: &mut Key, ttl: Duration) -> LockResult<()> {
        let token = key.unique_token(IDENTITY);
        key.reduce_lifetime(ttl);
        let mut entries = self.entries.lock().await;
        let now = SystemTime::now();
        match entries.get_mut(key.resource()) {
            Some(entry) if !entry.is_expired(now) && entry.held_by(&token) => {
                entry.expires_at = Some(now + ttl);
                Ok(())
            }
            _ => Err(LockError::Conflicted(key.resource().to_string())),
        }
    }

    async fn delete(&self, key: &mut Key) -> LockResult<()> {
        let Some(token) = key.token(IDENTITY).map(str::to_string) else {
            return Ok(());
        };
        let mut entries = self.entries.lock().await;
        let remove = if let Some(entry) = entries.get_mut(key.resource()) {
            if entry.writer.as_deref() == Some(token.as_str()) {
                entry.writer = None;
            }
            entry.readers.remove(&token);
            entry.writer.is_none() && entry.readers.is_empty()
        } else {
            false
        };
        if remove {
            entries.remove(key.resource());
        }
        Ok(())
    }

    async fn exists(&self, key: &Key) -> LockResult<bool> {
        let Some(token) = key.token(IDENTITY) else {
            return Ok(false);
        };
        let entries = self.entries.lock().await;
        Ok(entries.get(key.resource()).is_some_and(|entry| {
            !entry.is_expired(SystemTime::now()) && entry.held_by(token)
        }))
    }
}
