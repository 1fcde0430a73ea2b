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

//! MongoDB-based lock store.
//!
//! ## Purpose
//! One document per resource, `{_id: resource, token, expires_at}`, with
//! the unique `_id` index arbitrating contenders: `save` is an upsert whose
//! filter matches our own token or an expired deadline, so a losing upsert
//! surfaces as a duplicate-key error (E11000) and becomes a conflict.
//!
//! ## Expiry reaping
//! A TTL index on `expires_at` (`expireAfterSeconds: 0`) lets the server
//! reap dead locks. Index creation is probabilistic: each `save` runs a
//! Bernoulli trial with `gc_probability`, so the index appears lazily
//! without requiring admin-level setup at deploy time. Call
//! [`MongoDbStore::create_ttl_index`] for deterministic installation.
//!
//! CAUTION: expiry compares the server clock against `expires_at` values
//! written with the application clock. Keep both NTP-synchronized and pad
//! lock TTLs generously enough to absorb the residual drift; the TTL
//! reaper also only sweeps about once a minute.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use mongodb::bson::{doc, DateTime, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, IndexModel};
use rand::Rng;
use tokio::sync::OnceCell;
use tracing::{instrument, warn};

use crate::error::{LockError, LockResult};
use crate::key::Key;
use crate::store::{check_not_expired, validate_ttl, Capabilities, LockStore};

const IDENTITY: &str = "mongodb";

/// Duplicate-key error raised when the unique `_id` index rejects an
/// upsert.
const DUPLICATE_KEY: i32 = 11000;

/// Options for [`MongoDbStore`].
#[derive(Debug, Clone)]
pub struct MongoDbStoreOptions {
    /// Database holding the lock collection. Required.
    pub database: String,
    /// Collection holding one document per resource.
    pub collection: String,
    /// Lease applied by `save` before the coordinator refreshes it down to
    /// the caller's TTL.
    pub init_ttl: Duration,
    /// Probability that a `save` installs the TTL index, in `[0, 1]`.
    pub gc_probability: f64,
}

impl MongoDbStoreOptions {
    /// Options for `database` with the default collection (`locks`),
    /// initial TTL (300 s) and gc probability (0.001).
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: "locks".to_string(),
            init_ttl: Duration::from_secs(300),
            gc_probability: 0.001,
        }
    }
}

/// MongoDB lock store.
///
/// The driver client is created lazily on first use, so constructing the
/// store is cheap and never touches the network.
pub struct MongoDbStore {
    client: OnceCell<Client>,
    uri: String,
    options: MongoDbStoreOptions,
}

impl MongoDbStore {
    /// Creates a store for `uri`.
    ///
    /// Fails with [`LockError::InvalidArgument`] on an unsupported DSN
    /// scheme, a missing database or collection name, or an out-of-range
    /// `gc_probability`.
    #[instrument(skip(uri, options), fields(database = %options.database, collection = %options.collection))]
    pub fn new(uri: &str, options: MongoDbStoreOptions) -> LockResult<Self> {
        if !uri.starts_with("mongodb://") && !uri.starts_with("mongodb+srv://") {
            return Err(LockError::InvalidArgument(format!(
                "unsupported MongoDB DSN scheme: {uri}"
            )));
        }
        if options.database.is_empty() {
            return Err(LockError::InvalidArgument(
                "a database name is required".to_string(),
            ));
        }
        if options.collection.is_empty() {
            return Err(LockError::InvalidArgument(
                "a collection name is required".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&options.gc_probability) {
            return Err(LockError::InvalidArgument(format!(
                "gc_probability must be within [0, 1], got {}",
                options.gc_probability
            )));
        }
        validate_ttl(options.init_ttl)?;
        Ok(Self {
            client: OnceCell::new(),
            uri: uri.to_string(),
            options,
        })
    }

    async fn collection(&self) -> LockResult<Collection<Document>> {
        let client = self
            .client
            .get_or_try_init(|| async { Client::with_uri_str(&self.uri).await })
            .await
            .map_err(|err| LockError::Storage(format!("failed to connect MongoDB: {err}")))?;
        Ok(client
            .database(&self.options.database)
            .collection(&self.options.collection))
    }

    /// Installs the TTL index reaping expired locks.
    ///
    /// `save` calls this probabilistically; calling it once at deploy time
    /// makes the reaper deterministic.
    pub async fn create_ttl_index(&self) -> LockResult<()> {
        let collection = self.collection().await?;
        let model = IndexModel::builder()
            .keys(doc! { "expires_at": 1 })
            .options(
                IndexOptions::builder()
                    .expire_after(Duration::from_secs(0))
                    .build(),
            )
            .build();
        collection.create_index(model).await?;
        Ok(())
    }
}

fn deadline_after(ttl: Duration) -> DateTime {
    DateTime::from_system_time(SystemTime::now() + ttl)
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match &*err.kind {
        ErrorKind::Write(WriteFailure::WriteError(write)) => write.code == DUPLICATE_KEY,
        ErrorKind::Command(command) => command.code == DUPLICATE_KEY,
        _ => false,
    }
}

#[async_trait]
impl LockStore for MongoDbStore {
    fn identity(&self) -> &'static str {
        IDENTITY
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::PERSISTING | Capabilities::EXPIRING
    }

    async fn save(&self, key: &mut Key) -> LockResult<()> {
        if self.options.gc_probability > 0.0
            && rand::thread_rng().gen_bool(self.options.gc_probability)
        {
            if let Err(err) = self.create_ttl_index().await {
                warn!(error = %err, "failed to install the expiry reaper index");
            }
        }

        let token = key.unique_token(IDENTITY);
        key.reduce_lifetime(self.options.init_ttl);
        let collection = self.collection().await?;
        let filter = doc! {
            "_id": key.resource(),
            "$or": [
                { "token": &token },
                { "expires_at": { "$lte": DateTime::now() } },
            ],
        };
        let update = doc! {
            "$set": {
                "token": &token,
                "expires_at": deadline_after(self.options.init_ttl),
            },
        };
        match collection.update_one(filter, update).upsert(true).await {
            Ok(_) => check_not_expired(key),
            Err(err) if is_duplicate_key(&err) => {
                Err(LockError::Conflicted(key.resource().to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn put_off_expiration(&self, key: &mut Key, ttl: Duration) -> LockResult<()> {
        validate_ttl(ttl)?;
        let token = key.unique_token(IDENTITY);
        key.reduce_lifetime(ttl);
        let collection = self.collection().await?;
        let filter = doc! {
            "_id": key.resource(),
            "$or": [
                { "token": &token },
                { "expires_at": { "$lte": DateTime::now() } },
            ],
        };
        let update = doc! {
            "$set": {
                "token": &token,
                "expires_at": deadline_after(ttl),
            },
        };
        let outcome = collection.update_one(filter, update).await?;
        if outcome.matched_count == 0 {
            return Err(LockError::Conflicted(key.resource().to_string()));
        }
        check_not_expired(key)
    }

    async fn delete(&self, key: &mut Key) -> LockResult<()> {
        let Some(token) = key.token(IDENTITY) else {
            return Ok(());
        };
        let collection = self.collection().await?;
        collection
            .delete_one(doc! { "_id": key.resource(), "token": token })
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &Key) -> LockResult<bool> {
        let Some(token) = key.token(IDENTITY) else {
            return Ok(false);
        };
        let collection = self.collection().await?;
        let found = collection
            .find_one(doc! {
                "_id": key.resource(),
                "token": token,
                "expires_at": { "$gt": DateTime::now() },
            })
            .await?;
        Ok(found.is_some())
    }
}
