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

//! PostgreSQL advisory-lock store.
//!
//! ## Purpose
//! Locks backed by `pg_advisory_lock` and friends, keyed by the CRC-32 of
//! the resource name. Advisory locks are session-scoped: they survive until
//! released or until the connection dies, and they never expire, so
//! `put_off_expiration` only verifies the hold is still intact.
//!
//! ## Intra-process guard
//! Advisory locks do not conflict within one session: a second handle on
//! the same connection would happily "re-acquire" the first handle's lock.
//! An [`InMemoryStore`] in front of the connection serializes those
//! same-connection contenders before any SQL runs.
//!
//! ## Promotion and demotion
//! Switching between shared and exclusive acquires the new mode first and
//! then releases the opposite one, so the caller briefly holds both. The
//! release side runs the `pg_advisory_unlock` loop against `pg_locks`:
//! advisory locks are reference-counted per session, and a single unlock
//! only drops one reference.
//!
//! ## Concurrency
//! The store owns a single connection behind a mutex. A native blocking
//! acquisition holds that mutex while it waits server-side, stalling every
//! other operation on the same store instance; use one store per
//! connection when independent resources must not interfere.

use sqlx::{Connection, PgConnection};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::instrument;

use async_trait::async_trait;

use crate::error::{LockError, LockResult};
use crate::key::Key;
use crate::memory::InMemoryStore;
use crate::store::{retry_delay, Capabilities, LockStore};

const IDENTITY: &str = "postgres";

#[derive(Clone, Copy)]
enum AdvisoryMode {
    Exclusive,
    Shared,
}

impl AdvisoryMode {
    /// Mode name as `pg_locks` reports it.
    fn lock_mode(self) -> &'static str {
        match self {
            AdvisoryMode::Exclusive => "ExclusiveLock",
            AdvisoryMode::Shared => "ShareLock",
        }
    }

    fn unlock_statement(self) -> &'static str {
        match self {
            AdvisoryMode::Exclusive => "SELECT pg_advisory_unlock($1)",
            AdvisoryMode::Shared => "SELECT pg_advisory_unlock_shared($1)",
        }
    }
}

/// PostgreSQL advisory-lock store.
pub struct PostgresStore {
    conn: Mutex<PgConnection>,
    guard: InMemoryStore,
}

impl PostgresStore {
    /// Connects to `dsn`.
    ///
    /// Accepted schemes: `postgres://`, `postgresql://` and the
    /// `pgsql+advisory://` alias.
    #[instrument(skip(dsn))]
    pub async fn new(dsn: &str) -> LockResult<Self> {
        let dsn = normalize_dsn(dsn)?;
        let conn = PgConnection::connect(&dsn)
            .await
            .map_err(|err| LockError::Storage(format!("failed to connect PostgreSQL: {err}")))?;
        Ok(Self::from_connection(conn))
    }

    /// Wraps an already-established connection.
    ///
    /// The store assumes sole ownership: advisory locks taken by other
    /// users of the same session would confuse the unlock loop.
    pub fn from_connection(conn: PgConnection) -> Self {
        Self {
            conn: Mutex::new(conn),
            guard: InMemoryStore::new(),
        }
    }

    /// Unlocks `mode` until the session no longer shows a hold on `oid`.
    ///
    /// Advisory locks are reference-counted per session, and `pg_locks`
    /// keeps a single row per (object, mode) regardless of the count, so
    /// the row disappearing is the only reliable "fully released" signal.
    async fn unlock_loop(
        conn: &mut PgConnection,
        oid: i64,
        mode: AdvisoryMode,
    ) -> LockResult<()> {
        loop {
            let remaining: i64 = sqlx::query_scalar(
                "SELECT count(*) FROM pg_locks \
                 WHERE locktype = 'advisory' AND objid::bigint = $1 \
                   AND pid = pg_backend_pid() AND mode = $2",
            )
            .bind(oid)
            .bind(mode.lock_mode())
            .fetch_one(&mut *conn)
            .await?;
            if remaining == 0 {
                return Ok(());
            }
            sqlx::query(mode.unlock_statement())
                .bind(oid)
                .execute(&mut *conn)
                .await?;
        }
    }
}

fn normalize_dsn(dsn: &str) -> LockResult<String> {
    if dsn.starts_with("postgres://") || dsn.starts_with("postgresql://") {
        return Ok(dsn.to_string());
    }
    if let Some(rest) = dsn.strip_prefix("pgsql+advisory://") {
        return Ok(format!("postgres://{rest}"));
    }
    Err(LockError::InvalidArgument(format!(
        "unsupported PostgreSQL DSN scheme: {dsn}"
    )))
}

/// Advisory object id for a resource.
fn object_id(resource: &str) -> i64 {
    i64::from(crc32fast::hash(resource.as_bytes()))
}

#[async_trait]
impl LockStore for PostgresStore {
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
        let held_before = self.guard.exists(key).await?;
        self.guard.save(key).await?;
        let oid = object_id(key.resource());
        let mut conn = self.conn.lock().await;
        let granted: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(oid)
            .fetch_one(&mut *conn)
            .await?;
        if !granted {
            drop(conn);
            // a failed promotion keeps the pre-existing shared hold
            if held_before {
                let _ = self.guard.save_read(key).await;
            } else {
                let _ = self.guard.delete(key).await;
            }
            return Err(LockError::Conflicted(key.resource().to_string()));
        }
        // promotion: drop the shared hold now that the exclusive one is in
        Self::unlock_loop(&mut conn, oid, AdvisoryMode::Shared).await?;
        Ok(())
    }

    async fn save_read(&self, key: &mut Key) -> LockResult<()> {
        key.mark_unserializable();
        self.guard.save_read(key).await?;
        let oid = object_id(key.resource());
        let mut conn = self.conn.lock().await;
        let granted: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock_shared($1)")
            .bind(oid)
            .fetch_one(&mut *conn)
            .await?;
        if !granted {
            drop(conn);
            let _ = self.guard.delete(key).await;
            return Err(LockError::Conflicted(key.resource().to_string()));
        }
        // demotion: drop the exclusive hold now that the shared one is in
        Self::unlock_loop(&mut conn, oid, AdvisoryMode::Exclusive).await?;
        Ok(())
    }

    async fn wait_and_save(&self, key: &mut Key) -> LockResult<()> {
        key.mark_unserializable();
        // same-connection contenders are arbitrated here, not by the
        // server: the session would gladly re-enter its own lock
        loop {
            match self.guard.save(key).await {
                Ok(()) => break,
                Err(LockError::Conflicted(_)) => sleep(retry_delay()).await,
                Err(err) => return Err(err),
            }
        }
        let oid = object_id(key.resource());
        let mut conn = self.conn.lock().await;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(oid)
            .execute(&mut *conn)
            .await?;
        Self::unlock_loop(&mut conn, oid, AdvisoryMode::Shared).await?;
        Ok(())
    }

    async fn wait_and_save_read(&self, key: &mut Key) -> LockResult<()> {
        key.mark_unserializable();
        loop {
            match self.guard.save_read(key).await {
                Ok(()) => break,
                Err(LockError::Conflicted(_)) => sleep(retry_delay()).await,
                Err(err) => return Err(err),
            }
        }
        let oid = object_id(key.resource());
        let mut conn = self.conn.lock().await;
        sqlx::query("SELECT pg_advisory_lock_shared($1)")
            .bind(oid)
            .execute(&mut *conn)
            .await?;
        Self::unlock_loop(&mut conn, oid, AdvisoryMode::Exclusive).await?;
        Ok(())
    }

    async fn put_off_expiration(&self, key: &mut Key, _ttl: Duration) -> LockResult<()> {
        // advisory locks never expire; refreshing only verifies the hold
        if self.exists(key).await? {
            Ok(())
        } else {
            Err(LockError::Conflicted(key.resource().to_string()))
        }
    }

    async fn delete(&self, key: &mut Key) -> LockResult<()> {
        // never strip session locks belonging to another handle on this
        // connection
        if !self.guard.exists(key).await? {
            return Ok(());
        }
        let oid = object_id(key.resource());
        {
            let mut conn = self.conn.lock().await;
            Self::unlock_loop(&mut conn, oid, AdvisoryMode::Exclusive).await?;
            Self::unlock_loop(&mut conn, oid, AdvisoryMode::Shared).await?;
        }
        self.guard.delete(key).await
    }

    async fn exists(&self, key: &Key) -> LockResult<bool> {
        if !self.guard.exists(key).await? {
            return Ok(false);
        }
        let oid = object_id(key.resource());
        let mut conn = self.conn.lock().await;
        let held: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM pg_locks \
             WHERE locktype = 'advisory' AND objid::bigint = $1 \
               AND pid = pg_backend_pid()",
        )
        .bind(oid)
        .fetch_one(&mut *conn)
        .await?;
        Ok(held > 0)
    }
}
