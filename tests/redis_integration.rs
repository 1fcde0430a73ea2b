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

//! Redis store integration tests.
//!
//! Requires a reachable Redis server; set `DISTLOCK_REDIS_URL` or run one
//! on `redis://127.0.0.1:6379`.

#[cfg(feature = "redis-backend")]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    use distlock::redis::RedisStore;
    use distlock::{Key, Lock, LockError, LockStore};
    use tokio::time::sleep;

    fn redis_url() -> String {
        std::env::var("DISTLOCK_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    async fn create_store() -> RedisStore {
        RedisStore::new(&redis_url()).await.unwrap()
    }

    fn unique_resource(prefix: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("{prefix}-{nanos}")
    }

    #[tokio::test]
    async fn test_redis_exclusivity() {
        let store = create_store().await;
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
    async fn test_redis_round_trip_and_independence() {
        let store = create_store().await;
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
    async fn test_redis_non_owner_delete_is_a_noop() {
        let store = create_store().await;
        let resource = unique_resource("noop");
        let mut holder = Key::new(resource.clone()).unwrap();
        let mut other = Key::new(resource).unwrap();

        store.save(&mut holder).await.unwrap();
        store.delete(&mut other).await.unwrap();
        assert!(store.exists(&holder).await.unwrap());
        store.delete(&mut holder).await.unwrap();
    }

    #[tokio::test]
    async fn test_redis_shared_holds() {
        let store = create_store().await;
        let resource = unique_resource("shared");
        let mut reader1 = Key::new(resource.clone()).unwrap();
        let mut reader2 = Key::new(resource.clone()).unwrap();
        let mut writer = Key::new(resource).unwrap();

        store.save_read(&mut reader1).await.unwrap();
        store.save_read(&mut reader2).await.unwrap();
        assert!(store.exists(&reader1).await.unwrap());

        assert!(matches!(
            store.save(&mut writer).await,
            Err(LockError::Conflicted(_))
        ));

        store.delete(&mut reader2).await.unwrap();
        // the remaining reader promotes
        store.save(&mut reader1).await.unwrap();
        assert!(matches!(
            store.save_read(&mut writer).await,
            Err(LockError::Conflicted(_))
        ));
        store.delete(&mut reader1).await.unwrap();
    }

    #[tokio::test]
    async fn test_redis_ttl_expiry() {
        let store = RedisStore::with_init_ttl(&redis_url(), Duration::from_millis(300))
            .await
            .unwrap();
        let resource = unique_resource("ttl");
        let mut holder = Key::new(resource.clone()).unwrap();
        let mut contender = Key::new(resource).unwrap();

        store.save(&mut holder).await.unwrap();
        sleep(Duration::from_millis(500)).await;

        assert!(!store.exists(&holder).await.unwrap());
        store.save(&mut contender).await.unwrap();
        store.delete(&mut contender).await.unwrap();
    }

    #[tokio::test]
    async fn test_redis_put_off_requires_ownership() {
        let store = create_store().await;
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
    async fn test_redis_lock_lease_outlives_initial_ttl() {
        let store = Arc::new(
            RedisStore::with_init_ttl(&redis_url(), Duration::from_millis(400))
                .await
                .unwrap(),
        );
        let resource = unique_resource("lease");
        let mut lock = Lock::new(
            Key::new(resource.clone()).unwrap(),
            Arc::clone(&store) as Arc<dyn LockStore>,
        );

        assert!(lock.acquire(false).await.unwrap());
        sleep(Duration::from_millis(250)).await;
        lock.refresh(Some(Duration::from_millis(400))).await.unwrap();
        sleep(Duration::from_millis(250)).await;
        // past the original deadline, inside the refreshed one
        assert!(lock.is_acquired().await.unwrap());
        lock.release().await.unwrap();

        let mut contender = Lock::new(
            Key::new(resource).unwrap(),
            store as Arc<dyn LockStore>,
        );
        assert!(contender.acquire(false).await.unwrap());
        contender.release().await.unwrap();
    }
}
