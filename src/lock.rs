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

//! Lock coordinator.
//!
//! ## Purpose
//! [`Lock`] is the stateful handle a caller holds. It translates high-level
//! operations (acquire, refresh, release) into store calls, layering
//! polling fallback for stores without native blocking, shared-to-exclusive
//! promotion for stores without read locks, expiry post-checks, and
//! best-effort auto-release on drop.
//!
//! ## State machine
//! Fresh → Held → Released. A handle whose deadline elapsed is observably
//! `Expired` (the local clock says so); a handle whose `dirty` flag
//! disagrees with the backend is reconciled by [`Lock::is_acquired`]. A
//! released handle may start a new acquisition cycle.
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
//!     // critical section; call lock.refresh(None) to keep the lease
//!     lock.release().await?;
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{LockError, LockResult};
use crate::key::Key;
use crate::store::{retry_delay, validate_ttl, Capabilities, LockStore};

/// A handle on one resource in one store.
///
/// Handles are single-owner: every operation takes `&mut self`, so one
/// handle cannot be driven from two tasks at once. Distinct handles for the
/// same resource coordinate exclusively through the store.
///
/// `Lock` deliberately does not implement `serde::Serialize`; it carries
/// process-local identity that cannot be transported.
pub struct Lock {
    key: Key,
    store: Arc<dyn LockStore>,
    ttl: Option<Duration>,
    auto_release: bool,
    dirty: bool,
}

impl Lock {
    /// Creates a handle with no TTL and auto-release enabled.
    pub fn new(key: Key, store: Arc<dyn LockStore>) -> Self {
        Self {
            key,
            store,
            ttl: None,
            auto_release: true,
            dirty: false,
        }
    }

    /// Creates a handle with an explicit TTL and auto-release behavior.
    ///
    /// When a TTL is given, every successful acquisition immediately
    /// refreshes the store's default deadline down (or up) to it. Fails
    /// with [`LockError::InvalidTtl`] on a zero TTL.
    pub fn with_options(
        key: Key,
        store: Arc<dyn LockStore>,
        ttl: Option<Duration>,
        auto_release: bool,
    ) -> LockResult<Self> {
        if let Some(ttl) = ttl {
            validate_ttl(ttl)?;
        }
        Ok(Self {
            key,
            store,
            ttl,
            auto_release,
            dirty: false,
        })
    }

    /// The key this handle operates on.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// The resource this handle locks.
    pub fn resource(&self) -> &str {
        self.key.resource()
    }

    /// Acquires the lock exclusively.
    ///
    /// Non-blocking mode returns `Ok(false)` when the resource is held by
    /// someone else. Blocking mode uses the store's native wait when it has
    /// one and a jittered polling loop otherwise, and only returns once the
    /// lock is held or the backend failed.
    pub async fn acquire(&mut self, blocking: bool) -> LockResult<bool> {
        self.key.reset_lifetime();
        let caps = self.store.capabilities();
        let result = if blocking && caps.contains(Capabilities::BLOCKING_EXCLUSIVE) {
            self.store.wait_and_save(&mut self.key).await
        } else if blocking {
            loop {
                match self.store.save(&mut self.key).await {
                    Err(LockError::Conflicted(_)) => sleep(retry_delay()).await,
                    other => break other,
                }
            }
        } else {
            self.store.save(&mut self.key).await
        };
        self.finish_acquisition(result, blocking).await
    }

    /// Acquires the lock in shared (read) mode.
    ///
    /// Stores without read locks hand out a write lock instead; the
    /// requested blocking mode still applies on that promoted path.
    pub async fn acquire_read(&mut self, blocking: bool) -> LockResult<bool> {
        let caps = self.store.capabilities();
        if !caps.contains(Capabilities::SHARED) {
            return self.acquire(blocking).await;
        }
        self.key.reset_lifetime();
        let result = if blocking && caps.contains(Capabilities::BLOCKING_SHARED) {
            self.store.wait_and_save_read(&mut self.key).await
        } else if blocking {
            loop {
                match self.store.save_read(&mut self.key).await {
                    Err(LockError::Conflicted(_)) => sleep(retry_delay()).await,
                    other => break other,
                }
            }
        } else {
            self.store.save_read(&mut self.key).await
        };
        self.finish_acquisition(result, blocking).await
    }

    async fn finish_acquisition(
        &mut self,
        result: LockResult<()>,
        blocking: bool,
    ) -> LockResult<bool> {
        match result {
            Ok(()) => {}
            Err(LockError::Conflicted(resource)) => {
                self.dirty = false;
                if blocking {
                    // only a native blocking call that bailed out lands here
                    return Err(LockError::Conflicted(resource));
                }
                debug!(resource = %self.key, "lock not acquired, already held");
                return Ok(false);
            }
            Err(source) => {
                return Err(LockError::Acquiring {
                    resource: self.key.resource().to_string(),
                    source: Box::new(source),
                });
            }
        }

        self.dirty = true;
        debug!(resource = %self.key, "lock acquired");

        if self.ttl.is_some() {
            // translate the store's default TTL into the configured one
            self.refresh(None).await?;
        }

        if self.key.is_expired() {
            return Err(self.lost_to_deadline().await);
        }
        Ok(true)
    }

    /// Extends the lease.
    ///
    /// `ttl` defaults to the one fixed at construction; fails with
    /// [`LockError::InvalidTtl`] when neither is set. A
    /// [`LockError::Conflicted`] from the store means the holder changed:
    /// the `dirty` flag is cleared so a later drop does not try to delete a
    /// lock this handle no longer owns.
    pub async fn refresh(&mut self, ttl: Option<Duration>) -> LockResult<()> {
        let Some(ttl) = ttl.or(self.ttl) else {
            return Err(LockError::InvalidTtl(
                "refresh requires a TTL and none was configured".to_string(),
            ));
        };
        validate_ttl(ttl)?;
        self.key.reset_lifetime();
        match self.store.put_off_expiration(&mut self.key, ttl).await {
            Ok(()) => {
                self.dirty = true;
                debug!(resource = %self.key, ttl_ms = ttl.as_millis() as u64, "lease extended");
                if self.key.is_expired() {
                    return Err(self.lost_to_deadline().await);
                }
                Ok(())
            }
            Err(LockError::Conflicted(resource)) => {
                self.dirty = false;
                Err(LockError::Conflicted(resource))
            }
            Err(source) => Err(LockError::Acquiring {
                resource: self.key.resource().to_string(),
                source: Box::new(source),
            }),
        }
    }

    /// Releases the lock.
    ///
    /// After deleting, the store is re-read: a backend whose delete
    /// silently failed to reach durable state is surfaced as
    /// [`LockError::Releasing`] rather than pretending the lock is gone.
    pub async fn release(&mut self) -> LockResult<()> {
        let resource = self.key.resource().to_string();
        self.store
            .delete(&mut self.key)
            .await
            .map_err(|source| Self::wrap_releasing(&resource, source))?;
        self.dirty = false;

        let still_held = self
            .store
            .exists(&self.key)
            .await
            .map_err(|source| Self::wrap_releasing(&resource, source))?;
        if still_held {
            return Err(LockError::Releasing {
                resource,
                source: Box::new(LockError::Storage(
                    "resource still appears held after delete".to_string(),
                )),
            });
        }
        debug!(resource = %self.key, "lock released");
        Ok(())
    }

    /// Re-reads the backend and reconciles the `dirty` flag.
    ///
    /// This is the authoritative (but racy) ownership query; the lock may
    /// expire between this call and the caller acting on its answer.
    pub async fn is_acquired(&mut self) -> LockResult<bool> {
        let held = self.store.exists(&self.key).await?;
        self.dirty = held;
        Ok(held)
    }

    /// True when the key's local deadline is set and has elapsed. Purely
    /// local, never contacts the backend.
    pub fn is_expired(&self) -> bool {
        self.key.is_expired()
    }

    /// Time left on the local deadline, `None` when no deadline is set.
    pub fn remaining_lifetime(&self) -> Option<Duration> {
        self.key.remaining_lifetime()
    }

    /// The deadline elapsed while a backend call was in flight: the
    /// acquisition is judged lost. Releases best-effort and hands back the
    /// `Expired` error; a secondary failure must not mask it.
    async fn lost_to_deadline(&mut self) -> LockError {
        let resource = self.key.resource().to_string();
        if let Err(err) = self.release().await {
            warn!(resource = %resource, error = %err, "compensating release after expiry failed");
        }
        LockError::Expired(resource)
    }

    fn wrap_releasing(resource: &str, source: LockError) -> LockError {
        match source {
            err @ LockError::Releasing { .. } => err,
            source => LockError::Releasing {
                resource: resource.to_string(),
                source: Box::new(source),
            },
        }
    }
}

impl Drop for Lock {
    /// Best-effort release when the handle still believes it holds the
    /// resource and auto-release was requested. Failures are logged and
    /// swallowed since no caller remains to receive them.
    fn drop(&mut self) {
        if !self.auto_release || !self.dirty {
            return;
        }
        let mut key = self.key.clone();
        let store = Arc::clone(&self.store);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match store.exists(&key).await {
                        Ok(true) => {
                            if let Err(err) = store.delete(&mut key).await {
                                warn!(resource = %key, error = %err, "auto-release failed");
                            }
                        }
                        Ok(false) => {}
                        Err(err) => {
                            warn!(resource = %key, error = %err, "auto-release state check failed");
                        }
                    }
                });
            }
            Err(_) => {
                warn!(resource = %self.key, "auto-release skipped, no async runtime available");
            }
        }
    }
}

#[cfg(all(test, feature = "memory-backend"))]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::store::check_not_expired;
    use async_trait::async_trait;

    fn lock_on(resource: &str, store: &Arc<InMemoryStore>) -> Lock {
        Lock::new(Key::new(resource).unwrap(), Arc::clone(store) as Arc<dyn LockStore>)
    }

    #[tokio::test]
    async fn test_two_handles_contend() {
        let store = Arc::new(InMemoryStore::new());
        let mut first = lock_on("job/42", &store);
        let mut second = lock_on("job/42", &store);

        assert!(first.acquire(false).await.unwrap());
        assert!(!second.acquire(false).await.unwrap());

        first.release().await.unwrap();
        assert!(second.acquire(false).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_ttl_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let result = Lock::with_options(
            Key::new("r").unwrap(),
            store as Arc<dyn LockStore>,
            Some(Duration::ZERO),
            true,
        );
        assert!(matches!(result, Err(LockError::InvalidTtl(_))));
    }

    #[tokio::test]
    async fn test_blocking_acquire_polls_until_free() {
        let store = Arc::new(InMemoryStore::new());
        let mut waiter = lock_on("r", &store);

        let mut holder = lock_on("r", &store);
        assert!(holder.acquire(false).await.unwrap());
        tokio::spawn(async move {
            sleep(Duration::from_millis(250)).await;
            holder.release().await.unwrap();
        });

        assert!(waiter.acquire(true).await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_without_hold_conflicts_and_clears_dirty() {
        let store = Arc::new(InMemoryStore::new());
        let mut holder = lock_on("r", &store);
        let mut stranger = lock_on("r", &store);

        assert!(holder.acquire(false).await.unwrap());
        let result = stranger.refresh(Some(Duration::from_secs(10))).await;
        assert!(matches!(result, Err(LockError::Conflicted(_))));

        // the conflicted handle must not auto-release the real holder's lock
        drop(stranger);
        tokio::task::yield_now().await;
        assert!(holder.is_acquired().await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_extends_the_lease() {
        let store = Arc::new(InMemoryStore::new());
        let mut lock = lock_on("r", &store);

        assert!(lock.acquire(false).await.unwrap());
        lock.refresh(Some(Duration::from_millis(60))).await.unwrap();
        sleep(Duration::from_millis(30)).await;
        lock.refresh(Some(Duration::from_millis(60))).await.unwrap();
        sleep(Duration::from_millis(40)).await;
        // past the first deadline, still inside the refreshed one
        assert!(lock.is_acquired().await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_observed() {
        let store = Arc::new(InMemoryStore::new());
        let mut lock = lock_on("r", &store);
        let mut contender = lock_on("r", &store);

        assert!(lock.acquire(false).await.unwrap());
        lock.refresh(Some(Duration::from_millis(30))).await.unwrap();
        sleep(Duration::from_millis(80)).await;

        assert!(lock.is_expired());
        assert!(!lock.is_acquired().await.unwrap());
        assert!(contender.acquire(false).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquisition_lost_to_its_own_deadline() {
        let store = Arc::new(InMemoryStore::new());
        let key = Key::new("r").unwrap();
        let mut lock = Lock::with_options(
            key,
            Arc::clone(&store) as Arc<dyn LockStore>,
            Some(Duration::from_nanos(1)),
            true,
        )
        .unwrap();

        let result = lock.acquire(false).await;
        assert!(matches!(result, Err(LockError::Expired(_))));

        // the compensating release freed the resource
        let mut contender = lock_on("r", &store);
        assert!(contender.acquire(false).await.unwrap());
    }

    #[tokio::test]
    async fn test_shared_holds_coexist() {
        let store = Arc::new(InMemoryStore::new());
        let mut reader1 = lock_on("r", &store);
        let mut reader2 = lock_on("r", &store);
        let mut writer = lock_on("r", &store);

        assert!(reader1.acquire_read(false).await.unwrap());
        assert!(reader2.acquire_read(false).await.unwrap());
        assert!(!writer.acquire(false).await.unwrap());

        reader1.release().await.unwrap();
        reader2.release().await.unwrap();
        assert!(writer.acquire(false).await.unwrap());
    }

    #[tokio::test]
    async fn test_auto_release_on_drop() {
        let store = Arc::new(InMemoryStore::new());
        let mut held = lock_on("r", &store);
        assert!(held.acquire(false).await.unwrap());
        drop(held);

        // the teardown task runs on the same runtime
        sleep(Duration::from_millis(50)).await;
        let mut contender = lock_on("r", &store);
        assert!(contender.acquire(false).await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_auto_release_keeps_the_hold() {
        let store = Arc::new(InMemoryStore::new());
        let mut held = Lock::with_options(
            Key::new("r").unwrap(),
            Arc::clone(&store) as Arc<dyn LockStore>,
            None,
            false,
        )
        .unwrap();
        assert!(held.acquire(false).await.unwrap());
        drop(held);

        sleep(Duration::from_millis(50)).await;
        let mut contender = lock_on("r", &store);
        assert!(!contender.acquire(false).await.unwrap());
    }

    /// Store stub with no shared tier, used to observe the coordinator's
    /// read-to-write fallback.
    struct WriteOnlyStore {
        inner: InMemoryStore,
    }

    #[async_trait]
    impl LockStore for WriteOnlyStore {
        fn identity(&self) -> &'static str {
            "write_only"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::PERSISTING
        }

        async fn save(&self, key: &mut Key) -> LockResult<()> {
            self.inner.save(key).await
        }

        async fn put_off_expiration(&self, key: &mut Key, ttl: Duration) -> LockResult<()> {
            self.inner.put_off_expiration(key, ttl).await?;
            check_not_expired(key)
        }

        async fn delete(&self, key: &mut Key) -> LockResult<()> {
            self.inner.delete(key).await
        }

        async fn exists(&self, key: &Key) -> LockResult<bool> {
            self.inner.exists(key).await
        }
    }

    #[tokio::test]
    async fn test_acquire_read_promotes_on_stores_without_shared_tier() {
        let store = Arc::new(WriteOnlyStore {
            inner: InMemoryStore::new(),
        });
        let mut first = Lock::new(
            Key::new("r").unwrap(),
            Arc::clone(&store) as Arc<dyn LockStore>,
        );
        let mut second = Lock::new(Key::new("r").unwrap(), store as Arc<dyn LockStore>);

        // both ask for read locks; the promoted write lock makes them
        // mutually exclusive
        assert!(first.acquire_read(false).await.unwrap());
        assert!(!second.acquire_read(false).await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_requires_a_ttl() {
        let store = Arc::new(InMemoryStore::new());
        let mut lock = lock_on("r", &store);
        assert!(lock.acquire(false).await.unwrap());
        let result = lock.refresh(None).await;
        assert!(matches!(result, Err(LockError::InvalidTtl(_))));
    }
}
