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

//! File-lock store (`flock` / `LockFileEx`).
//!
//! ## Purpose
//! OS-level file locks over one lock file per resource in a configured
//! directory. Works across processes on one machine (or a shared
//! filesystem whose locking is trustworthy, which excludes most NFS
//! setups).
//!
//! ## Design
//! - A hold is the open file descriptor: the store keeps the `File` in a
//!   token-keyed table and the OS drops the lock when it closes. File
//!   locks are per open description, so two handles in one process contend
//!   exactly like two processes.
//! - Promotion and demotion re-lock the already-open descriptor.
//! - Blocking acquisition parks the `flock` call on the blocking thread
//!   pool.
//! - No TTL support: `put_off_expiration` only verifies the hold is still
//!   present. The lock file itself is never unlinked; removing it would
//!   race a concurrent opener of the same path.
//!
//! Keys touched by this store are marked non-serializable: a file
//! descriptor cannot migrate.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use sha1::{Digest, Sha1};
use tokio::sync::Mutex;
use tokio::task::spawn_blocking;
use tracing::instrument;

use crate::error::{LockError, LockResult};
use crate::key::Key;
use crate::store::{Capabilities, LockStore};

const IDENTITY: &str = "flock";

struct FlockHandle {
    file: File,
    shared: bool,
}

/// File-lock store.
pub struct FlockStore {
    directory: PathBuf,
    held: Mutex<HashMap<String, FlockHandle>>,
}

impl FlockStore {
    /// Creates a store placing lock files under `directory`.
    ///
    /// The directory is created when missing; failure to do so is a
    /// configuration error.
    #[instrument(skip(directory))]
    pub fn new(directory: impl Into<PathBuf>) -> LockResult<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory).map_err(|err| {
            LockError::InvalidArgument(format!(
                "lock directory {} is not usable: {err}",
                directory.display()
            ))
        })?;
        Ok(Self {
            directory,
            held: Mutex::new(HashMap::new()),
        })
    }

    /// The directory lock files live in.
    pub fn directory(&self) -> &PathBuf {
        &self.directory
    }

    fn path_for(&self, resource: &str) -> PathBuf {
        let mut flat: String = resource
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        flat.truncate(80);
        let digest = Sha1::digest(resource.as_bytes());
        let mut suffix = String::with_capacity(40);
        for byte in digest {
            suffix.push_str(&format!("{byte:02x}"));
        }
        self.directory.join(format!("{flat}-{suffix}.lock"))
    }

    fn open(&self, resource: &str) -> LockResult<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.path_for(resource))
            .map_err(LockError::from)
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[async_trait]
impl LockStore for FlockStore {
    fn identity(&self) -> &'static str {
        IDENTITY
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::PERSISTING
            | Capabilities::SHARED
            | Capabilities::BLOCKING_EXCLUSIVE
            | Capabilities::BLOCKING_SHARED
    }

    async fn save(&self, key: &mut Key) -> LockResult<()> {
        key.mark_unserializable();
        let token = key.unique_token(IDENTITY);
        let mut held = self.held.lock().await;
        if let Some(handle) = held.get_mut(&token) {
            if !handle.shared {
                return Ok(());
            }
            // promotion on the descriptor we already own
            return match handle.file.try_lock_exclusive() {
                Ok(()) => {
                    handle.shared = false;
                    Ok(())
                }
                Err(err) if is_contended(&err) => {
                    Err(LockError::Conflicted(key.resource().to_string()))
                }
                Err(err) => Err(err.into()),
            };
        }
        let file = self.open(key.resource())?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                held.insert(
                    token,
                    FlockHandle {
                        file,
                        shared: false,
                    },
                );
                Ok(())
            }
            Err(err) if is_contended(&err) => {
                Err(LockError::Conflicted(key.resource().to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn save_read(&self, key: &mut Key) -> LockResult<()> {
        key.mark_unserializable();
        let token = key.unique_token(IDENTITY);
        let mut held = self.held.lock().await;
        if let Some(handle) = held.get_mut(&token) {
            if handle.shared {
                return Ok(());
            }
            // demotion on the descriptor we already own
            return match handle.file.try_lock_shared() {
                Ok(()) => {
                    handle.shared = true;
                    Ok(())
                }
                Err(err) => {
                    let err: io::Error = err.into();
                    if is_contended(&err) {
                        Err(LockError::Conflicted(key.resource().to_string()))
                    } else {
                        Err(err.into())
                    }
                }
            };
        }
        let file = self.open(key.resource())?;
        match file.try_lock_shared() {
            Ok(()) => {
                held.insert(token, FlockHandle { file, shared: true });
                Ok(())
            }
            Err(err) => {
                let err: io::Error = err.into();
                if is_contended(&err) {
                    Err(LockError::Conflicted(key.resource().to_string()))
                } else {
                    Err(err.into())
                }
            }
        }
    }

    async fn wait_and_save(&self, key: &mut Key) -> LockResult<()> {
        key.mark_unserializable();
        let token = key.unique_token(IDENTITY);
        {
            let mut held = self.held.lock().await;
            if let Some(handle) = held.get_mut(&token) {
                if !handle.shared {
                    return Ok(());
                }
                // blocking upgrade on a duplicate of the held descriptor:
                // both fds share one open file description, hence one lock
                let file = handle.file.try_clone()?;
                drop(held);
                spawn_blocking(move || file.lock_exclusive())
                    .await
                    .map_err(|err| LockError::Storage(format!("flock worker failed: {err}")))??;
                if let Some(handle) = self.held.lock().await.get_mut(&token) {
                    handle.shared = false;
                }
                return Ok(());
            }
        }
        let file = self.open(key.resource())?;
        let file = spawn_blocking(move || file.lock_exclusive().map(|()| file))
            .await
            .map_err(|err| LockError::Storage(format!("flock worker failed: {err}")))??;
        self.held.lock().await.insert(
            token,
            FlockHandle {
                file,
                shared: false,
            },
        );
        Ok(())
    }

    async fn wait_and_save_read(&self, key: &mut Key) -> LockResult<()> {
        key.mark_unserializable();
        let token = key.unique_token(IDENTITY);
        {
            let mut held = self.held.lock().await;
            if let Some(handle) = held.get_mut(&token) {
                if handle.shared {
                    return Ok(());
                }
                let file = handle.file.try_clone()?;
                drop(held);
                spawn_blocking(move || file.lock_shared())
                    .await
                    .map_err(|err| LockError::Storage(format!("flock worker failed: {err}")))??;
                if let Some(handle) = self.held.lock().await.get_mut(&token) {
                    handle.shared = true;
                }
                return Ok(());
            }
        }
        let file = self.open(key.resource())?;
        let file = spawn_blocking(move || file.lock_shared().map(|()| file))
            .await
            .map_err(|err| LockError::Storage(format!("flock worker failed: {err}")))??;
        self.held
            .lock()
            .await
            .insert(token, FlockHandle { file, shared: true });
        Ok(())
    }

    async fn put_off_expiration(&self, key: &mut Key, _ttl: Duration) -> LockResult<()> {
        // file locks have no deadline; refreshing only verifies the hold
        if self.exists(key).await? {
            Ok(())
        } else {
            Err(LockError::Conflicted(key.resource().to_string()))
        }
    }

    async fn delete(&self, key: &mut Key) -> LockResult<()> {
        let Some(token) = key.token(IDENTITY) else {
            return Ok(());
        };
        // closing the descriptor releases the lock
        self.held.lock().await.remove(token);
        Ok(())
    }

    async fn exists(&self, key: &Key) -> LockResult<bool> {
        let Some(token) = key.token(IDENTITY) else {
            return Ok(false);
        };
        Ok(self.held.lock().await.contains_key(token))
    }
}
