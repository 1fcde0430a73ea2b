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

//! Redis-based lock store (single node).
//!
//! ## Purpose
//! TTL-based distributed locking on Redis primitives. Exclusive holds live
//! in a plain string key (`SET NX PX` semantics), shared holds in a sorted
//! set of tokens scored by their expiry instant. Every mutation runs as a
//! Lua script so the read-check-write sequence is atomic on the server.
//!
//! ## Persisted layout
//! - exclusive: `key = resource`, `value = token`, TTL = lease
//! - shared: `key = resource` as a sorted set, one member per reader token,
//!   `score = expiry epoch-millis`; the key TTL tracks the latest member
//!
//! The two layouts share one key name, so the type of the value is what
//! arbitrates between writer and readers. Expired readers are purged with
//! `ZREMRANGEBYSCORE` before any decision is taken.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::instrument;

use crate::error::{LockError, LockResult};
use crate::key::Key;
use crate::store::{check_not_expired, validate_ttl, Capabilities, LockStore};

const IDENTITY: &str = "redis";

/// Lease applied by `save` before the coordinator refreshes it down to the
/// caller's TTL.
const DEFAULT_INIT_TTL: Duration = Duration::from_secs(300);

const SAVE_SCRIPT: &str = r"
    if redis.call('EXISTS', KEYS[1]) == 1 then
        local kind = redis.call('TYPE', KEYS[1])
        kind = kind.ok or kind
        if kind == 'zset' then
            redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
            local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
            if score then
                redis.call('ZREM', KEYS[1], ARGV[1])
            end
            if redis.call('EXISTS', KEYS[1]) == 1 then
                if score then
                    redis.call('ZADD', KEYS[1], score, ARGV[1])
                end
                return 0
            end
        elseif redis.call('GET', KEYS[1]) ~= ARGV[1] then
            return 0
        end
    end
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[3])
    return 1
";

const SAVE_READ_SCRIPT: &str = r"
    local kind = redis.call('TYPE', KEYS[1])
    kind = kind.ok or kind
    if kind == 'string' then
        if redis.call('GET', KEYS[1]) ~= ARGV[1] then
            return 0
        end
        redis.call('DEL', KEYS[1])
    end
    redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
    redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
    local last = redis.call('ZRANGE', KEYS[1], -1, -1, 'WITHSCORES')
    redis.call('PEXPIREAT', KEYS[1], last[2])
    return 1
";

const PUT_OFF_SCRIPT: &str = r"
    local kind = redis.call('TYPE', KEYS[1])
    kind = kind.ok or kind
    if kind == 'zset' then
        redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
        if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
            return 0
        end
        redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
        local last = redis.call('ZRANGE', KEYS[1], -1, -1, 'WITHSCORES')
        redis.call('PEXPIREAT', KEYS[1], last[2])
        return 1
    end
    if redis.call('GET', KEYS[1]) ~= ARGV[1] then
        return 0
    end
    redis.call('PEXPIREAT', KEYS[1], ARGV[3])
    return 1
";

const DELETE_SCRIPT: &str = r"
    local kind = redis.call('TYPE', KEYS[1])
    kind = kind.ok or kind
    if kind == 'zset' then
        redis.call('ZREM', KEYS[1], ARGV[1])
    elseif redis.call('GET', KEYS[1]) == ARGV[1] then
        redis.call('DEL', KEYS[1])
    end
    return 1
";

const EXISTS_SCRIPT: &str = r"
    local kind = redis.call('TYPE', KEYS[1])
    kind = kind.ok or kind
    if kind == 'zset' then
        local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
        if score and tonumber(score) > tonumber(ARGV[2]) then
            return 1
        end
        return 0
    end
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return 1
    end
    return 0
";

/// Redis lock store.
pub struct RedisStore {
    conn: ConnectionManager,
    init_ttl: Duration,
    save_script: Script,
    save_read_script: Script,
    put_off_script: Script,
    delete_script: Script,
    exists_script: Script,
}

impl RedisStore {
    /// Connects with the default initial TTL (300 s).
    ///
    /// Example DSNs: `redis://127.0.0.1/`, `rediss://host:6380/0`.
    pub async fn new(dsn: &str) -> LockResult<Self> {
        Self::with_init_ttl(dsn, DEFAULT_INIT_TTL).await
    }

    /// Connects with an explicit initial TTL applied by `save`.
    #[instrument(skip(dsn, init_ttl))]
    pub async fn with_init_ttl(dsn: &str, init_ttl: Duration) -> LockResult<Self> {
        validate_ttl(init_ttl)?;
        let client = redis::Client::open(dsn)
            .map_err(|err| LockError::InvalidArgument(format!("unsupported Redis DSN: {err}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|err| LockError::Storage(format!("failed to connect Redis: {err}")))?;
        Self::from_connection_manager(conn, init_ttl)
    }

    /// Wraps an already-established connection manager.
    pub fn from_connection_manager(
        conn: ConnectionManager,
        init_ttl: Duration,
    ) -> LockResult<Self> {
        validate_ttl(init_ttl)?;
        Ok(Self {
            conn,
            init_ttl,
            save_script: Script::new(SAVE_SCRIPT),
            save_read_script: Script::new(SAVE_READ_SCRIPT),
            put_off_script: Script::new(PUT_OFF_SCRIPT),
            delete_script: Script::new(DELETE_SCRIPT),
            exists_script: Script::new(EXISTS_SCRIPT),
        })
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

#[async_trait]
impl LockStore for RedisStore {
    fn identity(&self) -> &'static str {
        IDENTITY
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::PERSISTING | Capabilities::EXPIRING | Capabilities::SHARED
    }

    async fn save(&self, key: &mut Key) -> LockResult<()> {
        let token = key.unique_token(IDENTITY);
        key.reduce_lifetime(self.init_ttl);
        let mut conn = self.conn.clone();
        let granted: i64 = self
            .save_script
            .key(key.resource())
            .arg(&token)
            .arg(now_millis())
            .arg(self.init_ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        if granted == 0 {
            return Err(LockError::Conflicted(key.resource().to_string()));
        }
        check_not_expired(key)
    }

    async fn save_read(&self, key: &mut Key) -> LockResult<()> {
        let token = key.unique_token(IDENTITY);
        key.reduce_lifetime(self.init_ttl);
        let now = now_millis();
        let mut conn = self.conn.clone();
        let granted: i64 = self
            .save_read_script
            .key(key.resource())
            .arg(&token)
            .arg(now)
            .arg(now + self.init_ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        if granted == 0 {
            return Err(LockError::Conflicted(key.resource().to_string()));
        }
        check_not_expired(key)
    }

    async fn put_off_expiration(&self, key: &mut Key, ttl: Duration) -> LockResult<()> {
        validate_ttl(ttl)?;
        let token = key.unique_token(IDENTITY);
        key.reduce_lifetime(ttl);
        let now = now_millis();
        let mut conn = self.conn.clone();
        let granted: i64 = self
            .put_off_script
            .key(key.resource())
            .arg(&token)
            .arg(now)
            .arg(now + ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        if granted == 0 {
            return Err(LockError::Conflicted(key.resource().to_string()));
        }
        check_not_expired(key)
    }

    async fn delete(&self, key: &mut Key) -> LockResult<()> {
        let Some(token) = key.token(IDENTITY).map(str::to_string) else {
            return Ok(());
        };
        let mut conn = self.conn.clone();
        let _: i64 = self
            .delete_script
            .key(key.resource())
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &Key) -> LockResult<bool> {
        let Some(token) = key.token(IDENTITY) else {
            return Ok(false);
        };
        let mut conn = self.conn.clone();
        let held: i64 = self
            .exists_script
            .key(key.resource())
            .arg(token)
            .arg(now_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(held == 1)
    }
}
