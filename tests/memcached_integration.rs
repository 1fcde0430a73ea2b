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

//! Memcached store integration tests.
//!
//! Requires a reachable memcached server; set `DISTLOCK_MEMCACHED_URL` or
//! run one on `memcached://127.0.0.1:11211`.
//!
//! Memcached TTLs are whole seconds, so the expiry scenario here runs on a
//! multi-second clock.

#[cfg(feature = "memcached-backend")]
mod tests {
    use std::time::{Duration, SystemTime};

    use distlock::memcached::MemcachedStore;
    use distlock::{Key, LockError, LockStore};
    use tokio::time::sleep;

    fn memcached_url() -> String {
        std::env::var("DISTLOCK_MEMCACHED_URL")
            .unwrap_or_else(|_| "memcached://127.0.0.1:11211".to_string())
    }

    fn create_store() -> MemcachedStore {
        MemcachedStore::new(&memcached_url()).unwrap()
    }

    fn unique_resource(prefix: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("{prefix}-{nanos}")
    }

    #[tokio::test]
    async fn test_memcached_exclusivity_and_reacquire() {
        let store = create_store();
        let resource = unique_resource("excl");
        let mut holder = Key::new(resource.clone()).unwrap();
        let mut contender = Key::new(resource).unwrap();

        store.save(&mut holder).await.unwrap();
        assert!(matches!(
            store.save(&mut contender).await,
            Err(LockError::Conflicted(_))
        ));
        // self-reacquire goes through the put-off fallback
        store.save(&mut holder).await.unwrap();
        assert!(store.exists(&holder).await.unwrap());

        store.delete(&mut holder).await.unwrap();
        assert!(!store.exists(&holder).await.unwrap());
        store.save(&mut contender).await.unwrap();
        store.delete(&mut contender).await.unwrap();
    }

    #[tokio::test]
    async fn test_memcached_non_owner_delete_is_a_noop() {
        let store = create_store();
        let resource = unique_resource("noop");
        let mut holder = Key::new(resource.clone()).unwrap();
        let mut other = Key::new(resource).unwrap();

        store.save(&mut holder).await.unwrap();
        other.unique_token(store.identity());
        store.delete(&mut other).await.unwrap();
        assert!(store.exists(&holder).await.unwrap());
        store.delete(&mut holder).await.unwrap();
    }

    #[tokio::test]
    async fn test_memcached_ttl_expiry() {
        let store =
            MemcachedStore::with_init_ttl(&memcached_url(), Duration::from_secs(1)).unwrap();
        let resource = unique_resource("ttl");
        let mut holder = Key::new(resource.clone()).unwrap();
        let mut contender = Key::new(resource).unwrap();

        store.save(&mut holder).await.unwrap();
        sleep(Duration::from_millis(2500)).await;

        assert!(!store.exists(&holder).await.unwrap());
        store.save(&mut contender).await.unwrap();
        store.delete(&mut contender).await.unwrap();
    }

    #[tokio::test]
    async fn test_memcached_refresh_extends_past_original_deadline() {
        let store =
            MemcachedStore::with_init_ttl(&memcached_url(), Duration::from_secs(2)).unwrap();
        let mut key = Key::new(unique_resource("refresh")).unwrap();

        store.save(&mut key).await.unwrap();
        sleep(Duration::from_millis(1000)).await;
        store
            .put_off_expiration(&mut key, Duration::from_secs(2))
            .await
            .unwrap();
        sleep(Duration::from_millis(1500)).await;
        // past the original 2 s deadline, inside the refreshed one
        assert!(store.exists(&key).await.unwrap());
        store.delete(&mut key).await.unwrap();
    }

    #[tokio::test]
    async fn test_memcached_put_off_requires_ownership() {
        let store = create_store();
        let resource = unique_resource("putoff");
        let mut holder = Key::new(resource.clone()).unwrap();
        let mut other = Key::new(resource).unwrap();

        store.save(&mut holder).await.unwrap();
        other.unique_token(store.identity());
        assert!(matches!(
            store.put_off_expiration(&mut other, Duration::from_secs(30)).await,
            Err(LockError::Conflicted(_))
        ));
        store.delete(&mut holder).await.unwrap();
    }

    #[tokio::test]
    async fn test_memcached_awkward_resource_names() {
        let store = create_store();
        let resource = format!("jobs with spaces/{}", "x".repeat(400));
        let mut key = Key::new(resource).unwrap();

        store.save(&mut key).await.unwrap();
        assert!(store.exists(&key).await.unwrap());
        store.delete(&mut key).await.unwrap();
        assert!(!store.exists(&key).await.unwrap());
    }
}
