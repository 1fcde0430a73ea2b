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

//! ZooKeeper-based lock store.
//!
//! ## Purpose
//! One ephemeral node per resource at the chroot root, node data = fencing
//! token. `NODEEXISTS` on create is the conflict signal; the server reaps
//! the node when the creating session dies, so holds are session-lifetime
//! rather than TTL-based and `put_off_expiration` has nothing to do.
//!
//! Resources containing `/` are flattened (`/` becomes `-`) with a SHA-1
//! suffix of the original, keeping every lock a direct child of the root.
//!
//! Keys touched by this store are marked non-serializable: the hold is tied
//! to this process's session and cannot migrate.

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tracing::instrument;

use crate::error::{LockError, LockResult};
use crate::key::Key;
use crate::store::{Capabilities, LockStore};

const IDENTITY: &str = "zookeeper";

/// ZooKeeper lock store.
pub struct ZooKeeperStore {
    client: zookeeper_client::Client,
}

impl ZooKeeperStore {
    /// Connects to `dsn`.
    ///
    /// Accepted forms: `zookeeper://host1,host2:2181/chroot`,
    /// `zk://host:2181`, or a bare cluster string.
    #[instrument(skip(dsn))]
    pub async fn new(dsn: &str) -> LockResult<Self> {
        let cluster = match dsn.split_once("://") {
            Some(("zookeeper" | "zk", rest)) => rest,
            Some(_) => {
                return Err(LockError::InvalidArgument(format!(
                    "unsupported ZooKeeper DSN scheme: {dsn}"
                )));
            }
            None => dsn,
        };
        if cluster.is_empty() {
            return Err(LockError::InvalidArgument(
                "empty ZooKeeper cluster string".to_string(),
            ));
        }
        let client = zookeeper_client::Client::connect(cluster)
            .await
            .map_err(|err| LockError::Storage(format!("failed to connect ZooKeeper: {err}")))?;
        Ok(Self::from_client(client))
    }

    /// Wraps an already-established session.
    pub fn from_client(client: zookeeper_client::Client) -> Self {
        Self { client }
    }
}

/// Node path for a resource, flattened to live directly under the root.
fn node_path(resource: &str) -> String {
    if !resource.contains('/') {
        return format!("/{resource}");
    }
    let flat = resource.replace('/', "-");
    let flat = flat.trim_matches('-');
    let digest = Sha1::digest(resource.as_bytes());
    let mut suffix = String::with_capacity(40);
    for byte in digest {
        suffix.push_str(&format!("{byte:02x}"));
    }
    format!("/{flat}-{suffix}")
}

#[async_trait]
impl LockStore for ZooKeeperStore {
    fn identity(&self) -> &'static str {
        IDENTITY
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::PERSISTING
    }

    async fn save(&self, key: &mut Key) -> LockResult<()> {
        key.mark_unserializable();
        let token = key.unique_token(IDENTITY);
        let path = node_path(key.resource());
        let options =
            zookeeper_client::CreateMode::Ephemeral.with_acls(zookeeper_client::Acls::anyone_all());
        match self
            .client
            .create(&path, token.as_bytes(), &options)
            .await
        {
            Ok(_) => Ok(()),
            Err(zookeeper_client::Error::NodeExists) => {
                // idempotent when the node is our own
                if self.exists(key).await? {
                    Ok(())
                } else {
                    Err(LockError::Conflicted(key.resource().to_string()))
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn put_off_expiration(&self, key: &mut Key, _ttl: std::time::Duration) -> LockResult<()> {
        // holds live and die with the session, there is no deadline to move
        let _ = key;
        Ok(())
    }

    async fn delete(&self, key: &mut Key) -> LockResult<()> {
        if !self.exists(key).await? {
            // not ours (or already gone): leave the current holder alone
            return Ok(());
        }
        let path = node_path(key.resource());
        match self.client.delete(&path, None).await {
            Ok(()) | Err(zookeeper_client::Error::NoNode) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, key: &Key) -> LockResult<bool> {
        let Some(token) = key.token(IDENTITY) else {
            return Ok(false);
        };
        let path = node_path(key.resource());
        match self.client.get_data(&path).await {
            Ok((data, _stat)) => Ok(data == token.as_bytes()),
            Err(zookeeper_client::Error::NoNode) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
