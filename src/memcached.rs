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

//! Memcached-based lock store.
//!
//! ## Purpose
//! TTL-based locking on the memcached `ADD` / `CAS` primitives. The value
//! under the resource key is the holder's fencing token; ownership changes
//! are always CAS-guarded so a concurrent contender can never be clobbered.
//!
//! ## Design
//! - `save` is a plain `ADD`; when the key already exists the call falls
//!   through to `put_off_expiration`, which tells a self-reacquire apart
//!   from a foreign holder.
//! - `delete` uses extend-then-delete: the TTL is CAS'd down to a small
//!   grace window before the actual `DELETE`, so a contender that races the
//!   delete never observes a long-lived stale value.
//! - The `memcache` client is synchronous (r2d2-pooled); every round trip
//!   runs on the blocking thread pool.
//!
//! Memcached truncates TTLs to whole seconds; sub-second leases are rounded
//! up.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tokio::task::spawn_blocking;
use tracing::instrument;

use crate::error::{LockError, LockResult};
use crate::key::Key;
use crate::store::{check_not_expired, validate_ttl, Capabilities, LockStore};

const IDENTITY: &str = "memcached";

/// Lease applied by `save` before the coordinator refreshes it down to the
/// caller's TTL.
const DEFAULT_INIT_TTL: Duration = Duration::from_secs(300);

/// TTL left on a value while an owned delete is in flight.
const DELETE_GRACE_SECS: u32 = 2;

/// Longest key memcached accepts.
const MAX_KEY_LEN: usize = 250;

type CasValue = (Vec<u8>, u32, Option<u64>);

/// Memcached lock store.
pub struct MemcachedStore {
    client: memcache::Client,
    init_ttl: Duration,
}

impl MemcachedStore {
    /// Connects with the default initial TTL (300 s).
    ///
    /// Example DSNs: `memcached://127.0.0.1:11211`,
    /// `memcache://host:11211?timeout=10`.
    pub fn new(dsn: &str) -> LockResult<Self> {
        Self::with_init_ttl(dsn, DEFAULT_INIT_TTL)
    }

    /// Connects with an explicit initial TTL applied by `save`.
    #[instrument(skip(dsn, init_ttl))]
    pub fn with_init_ttl(dsn: &str, init_ttl: Duration) -> LockResult<Self> {
        validate_ttl(init_ttl)?;
        // the driver only knows the memcache:// spelling
        let dsn = match dsn.strip_prefix("memcached://") {
            Some(rest) => format!("memcache://{rest}"),
            None => dsn.to_string(),
        };
        let client = memcache::connect(dsn.as_str())
            .map_err(|err| LockError::InvalidArgument(format!("unsupported Memcached DSN: {err}")))?;
        Ok(Self { client, init_ttl })
    }

    async fn fetch(&self, storage_key: String) -> LockResult<Option<CasValue>> {
        let client = self.client.clone();
        let mut found: HashMap<String, CasValue> =
            spawn_blocking(move || client.gets(&[storage_key.as_str()]))
                .await
                .map_err(|err| LockError::Storage(format!("Memcached worker failed: {err}")))??;
        let value = found.drain().next().map(|(_, value)| value);
        Ok(value)
    }
}

fn ttl_secs(ttl: Duration) -> u32 {
    (ttl.as_secs_f64().ceil() as u32).max(1)
}

/// Memcached keys are capped at 250 bytes of printable ASCII; anything else
/// is flattened and suffixed with a digest of the original.
fn storage_key(resource: &str) -> String {
    let printable = resource
        .bytes()
        .all(|byte| byte.is_ascii_graphic());
    if printable && resource.len() <= MAX_KEY_LEN {
        return resource.to_string();
    }
    let mut flat: String = resource
        .chars()
        .map(|c| if c.is_ascii_graphic() { c } else { '-' })
        .collect();
    flat.truncate(MAX_KEY_LEN - 41);
    let digest = Sha1::digest(resource.as_bytes());
    let mut suffix = String::with_capacity(40);
    for byte in digest {
        suffix.push_str(&format!("{byte:02x}"));
    }
    format!("{flat}-{suffix}")
}

#[async_trait]
impl LockStore for MemcachedStore {
    fn identity(&self) -> &'static str {
        IDENTITY
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::PERSISTING | Capabilities::EXPIRING
    }

    async fn save(&self, key: &mut Key) -> LockResult<()> {
        let token = key.unique_token(IDENTITY);
        key.reduce_lifetime(self.init_ttl);
        let client = self.client.clone();
        let storage = storage_key(key.resource());
        let value = token.clone();
        let exp = ttl_secs(self.init_ttl);
        let added = spawn_blocking(move || client.add(&storage, value.as_str(), exp))
            .await
            .map_err(|err| LockError::Storage(format!("Memcached worker failed: {err}")))?;
        match added {
            Ok(()) => check_not_expired(key),
            // the key exists; put_off_expiration arbitrates between a
            // self-reacquire and a foreign holder
            Err(memcache::MemcacheError::CommandError(_)) => {
                self.put_off_expiration(key, self.init_ttl).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn put_off_expiration(&self, key: &mut Key, ttl: Duration) -> LockResult<()> {
        validate_ttl(ttl)?;
        let token = key.unique_token(IDENTITY);
        key.reduce_lifetime(ttl);
        let storage = storage_key(key.resource());
        let exp = ttl_secs(ttl);
        loop {
            let Some((value, _flags, cas_id)) = self.fetch(storage.clone()).await? else {
                return Err(LockError::Conflicted(key.resource().to_string()));
            };
            if value != token.as_bytes() {
                return Err(LockError::Conflicted(key.resource().to_string()));
            }
            let Some(cas_id) = cas_id else {
                return Err(LockError::Storage(
                    "Memcached did not return a cas id".to_string(),
                ));
            };
            let client = self.client.clone();
            let storage_for_cas = storage.clone();
            let value = token.clone();
            let swapped =
                spawn_blocking(move || client.cas(&storage_for_cas, value.as_str(), exp, cas_id))
                    .await
                    .map_err(|err| LockError::Storage(format!("Memcached worker failed: {err}")))??;
            if swapped {
                break;
            }
            // lost a CAS race; re-read to find out against whom
        }
        check_not_expired(key)
    }

    async fn delete(&self, key: &mut Key) -> LockResult<()> {
        let Some(token) = key.token(IDENTITY).map(str::to_string) else {
            return Ok(());
        };
        let storage = storage_key(key.resource());
        let Some((value, _flags, cas_id)) = self.fetch(storage.clone()).await? else {
            return Ok(());
        };
        if value != token.as_bytes() {
            // not ours; leave the current holder alone
            return Ok(());
        }
        let Some(cas_id) = cas_id else {
            return Err(LockError::Storage(
                "Memcached did not return a cas id".to_string(),
            ));
        };
        // shrink the TTL first: if the DELETE below is lost, the entry
        // still evaporates within the grace window instead of lingering
        let client = self.client.clone();
        let storage_for_cas = storage.clone();
        let value = token.clone();
        let swapped = spawn_blocking(move || {
            client.cas(&storage_for_cas, value.as_str(), DELETE_GRACE_SECS, cas_id)
        })
        .await
        .map_err(|err| LockError::Storage(format!("Memcached worker failed: {err}")))?;
        match swapped {
            Ok(true) => {}
            // someone else took over between the read and the CAS
            Ok(false) | Err(memcache::MemcacheError::CommandError(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        let client = self.client.clone();
        spawn_blocking(move || client.delete(&storage))
            .await
            .map_err(|err| LockError::Storage(format!("Memcached worker failed: {err}")))??;
        Ok(())
    }

    async fn exists(&self, key: &Key) -> LockResult<bool> {
        let Some(token) = key.token(IDENTITY) else {
            return Ok(false);
        };
        let found = self.fetch(storage_key(key.resource())).await?;
        Ok(found.is_some_and(|(value, _flags, _cas)| value == token.as_bytes()))
    }
}
