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

//! MongoDB store integration tests.
//!
//! Requires a reachable server; set `DISTLOCK_MONGODB_URL` or run one on
//! `mongodb://127.0.0.1:27017`.
//!
//! Expiry here is observed through `exists` (which compares `expires_at`
//! itself); the server-side TTL reaper only sweeps about once a minute and
//! is not what these tests wait on.

#[cfg(feature = "mongodb-backend")]
mod tests {
    use std::time::{Duration, SystemTime};

    use distlock::mongodb::{MongoDbStore, MongoDbStoreOptions};
    use distlock::{Key, LockError, LockStore};
    use tokio::time::sleep;

    fn mongodb_url() -> String {
        std::env::var("DISTLOCK_MONGODB_URL")
            .unwrap_or_else(|_| "mongodb://127.0.0.1:27017".to_string())
    }

    fn create_store() -> MongoDbStore {
        MongoDbStore::new(&mongodb_url(), MongoDbStoreOptions::new("distlock_tests")).unwrap()
    }

    fn unique_resource(prefix: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("{prefix}-{nanos}")
    }

    #[tokio::test]
    async fn test_mongodb_exclusivity() {
        let store = create_store();
        let resource = unique_resource("excl");
        let mut holder = Key::new(resource.clone()).unwrap();
        let mut contender = Key::new(resource).unwrap();

        store.save(&mut holder).await.unwrap();
        assert!(matches!(
            store.save(&mut contender).await,
            Err(LockError::Conflicted(_))
        ));
        // idempotent for the same key
        store.save(&mut holder).await.unwrap();

        store.delete(&mut holder).await.unwrap();
        store.save(&mut contender).await.unwrap();
        store.delete(&mut contender).await.unwrap();
    }

    #[tokio::test]
    async fn test_mongodb_round_trip_and_independence() {
        let store = create_store();
        let mut a = Key::new(unique_resource("rt-a")).unwrap();
        let mut b = Key::new(unique_resource("rt-b")).unwrap();

        store.save(&mut a).await.unwrap();
        store.save(&mut b).await.unwrap();
        assert!(store.exists(&a).await.unwrap());

        store.delete(&mut a).await.unwrap();
        assert!(!store.exists(&a).await.unwrap());
        assert!(store.exists(&b).await.unwrap());
        store.delete(&mut b).await.unwrap();
    }

    #[tokio::test]
    async fn test_mongodb_non_owner_delete_is_a_noop() {
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
    async fn test_mongodb_expired_lock_is_reacquirable() {
        let mut options = MongoDbStoreOptions::new("distlock_tests");
        options.init_ttl = Duration::from_millis(300);
        let store = MongoDbStore::new(&mongodb_url(), options).unwrap();
        let resource = unique_resource("ttl");
        let mut holder = Key::new(resource.clone()).unwrap();
        let mut contender = Key::new(resource).unwrap();

        store.save(&mut holder).await.unwrap();
        sleep(Duration::from_millis(500)).await;

        assert!(!store.exists(&holder).await.unwrap());
        // the dead document is taken over in place
        store.save(&mut contender).await.unwrap();
        assert!(store.exists(&contender).await.unwrap());
        store.delete(&mut contender).await.unwrap();
    }

    #[tokio::test]
    async fn test_mongodb_put_off_requires_ownership() {
        let store = create_store();
        let resource = unique_resource("putoff");
        let mut holder = Key::new(resource.clone()).unwrap();
        let mut other = Key::new(resource).unwrap();

        store.save(&mut holder).await.unwrap();
        store
            .put_off_expiration(&mut holder, Duration::from_secs(30))
            .await
            .unwrap();
        other.unique_token(store.identity());
        assert!(matches!(
            store.put_off_expiration(&mut other, Duration::from_secs(30)).await,
            Err(LockError::Conflicted(_))
        ));
        store.delete(&mut holder).await.unwrap();
    }

    #[tokio::test]
    async fn test_mongodb_ttl_index_installation_is_idempotent() {
        let store = create_store();
        store.create_ttl_index().await.unwrap();
        store.create_ttl_index().await.unwrap();
    }
}
