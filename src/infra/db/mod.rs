//! Usage: SQLite pools for the accounting store (one writer, one read-only replica) plus integer helpers.

mod migrations;

use crate::shared::error::db_err;
use crate::shared::error::AppResult;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::time::Duration;

/// Sizing for one r2d2 pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PoolProfile {
    max_size: u32,
    min_idle: u32,
    checkout_timeout: Duration,
    busy_timeout: Duration,
}

impl PoolProfile {
    /// SQLite serializes writers; a few connections cover credit debits, flushes and admin edits.
    const WRITER: Self = Self {
        max_size: 4,
        min_idle: 1,
        checkout_timeout: Duration::from_secs(5),
        busy_timeout: Duration::from_secs(5),
    };

    /// Caller and model lookups on cache misses.
    const READER: Self = Self {
        max_size: 16,
        min_idle: 2,
        checkout_timeout: Duration::from_secs(5),
        busy_timeout: Duration::from_secs(2),
    };

    fn build(
        self,
        manager: SqliteConnectionManager,
        role: &'static str,
    ) -> AppResult<Pool<SqliteConnectionManager>> {
        tracing::debug!(
            role,
            max_size = self.max_size,
            min_idle = self.min_idle,
            "building sqlite pool"
        );
        Pool::builder()
            .max_size(self.max_size)
            .min_idle(Some(self.min_idle.min(self.max_size)))
            .connection_timeout(self.checkout_timeout)
            .build(manager)
            .map_err(|e| db_err!("failed to create {role} pool: {e}"))
    }
}

/// Accepts a bare path or a `sqlite://` / `file:` DSN.
fn dsn_to_path(dsn: &str) -> &str {
    let trimmed = dsn.trim();
    trimmed
        .strip_prefix("sqlite://")
        .or_else(|| trimmed.strip_prefix("file:"))
        .unwrap_or(trimmed)
}

#[derive(Clone)]
pub struct Db {
    pool: Pool<SqliteConnectionManager>,
}

impl Db {
    pub(crate) fn open_connection(
        &self,
    ) -> AppResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| db_err!("failed to get connection from pool: {e}"))
    }
}

/// Process-wide database handles: one writer, one read replica.
#[derive(Clone)]
pub struct Databases {
    pub write: Db,
    pub read: Db,
}

impl Databases {
    pub fn open(dsn: &str, read_dsn: &str) -> AppResult<Self> {
        let write = open_write(dsn)?;
        let read = open_read_only(read_dsn)?;
        Ok(Self { write, read })
    }
}

/// SQLite stores integers as i64; balances and counters never exceed that in practice.
pub(crate) fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Opens the writer pool and brings the schema up to date before handing it out.
pub fn open_write(dsn: &str) -> AppResult<Db> {
    let path = Path::new(dsn_to_path(dsn));
    let profile = PoolProfile::WRITER;

    let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
        conn.busy_timeout(profile.busy_timeout)?;
        prepare_writer(conn)
    });
    let pool = profile.build(manager, "write")?;

    let mut conn = pool
        .get()
        .map_err(|e| db_err!("failed to get startup connection: {e}"))?;
    migrations::apply_migrations(&mut conn)
        .map_err(|e| db_err!("sqlite migration failed at {}: {e}", path.display()))?;

    tracing::info!(path = %path.display(), "sqlite write pool ready");
    Ok(Db { pool })
}

/// Opens a pool that refuses writes; the schema must already exist.
pub fn open_read_only(dsn: &str) -> AppResult<Db> {
    let path = Path::new(dsn_to_path(dsn));
    let profile = PoolProfile::READER;

    let manager = SqliteConnectionManager::file(path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_init(move |conn| {
            conn.busy_timeout(profile.busy_timeout)?;
            conn.execute_batch("PRAGMA query_only = ON;")
        });
    let pool = profile.build(manager, "read")?;

    tracing::info!(path = %path.display(), "sqlite read pool ready");
    Ok(Db { pool })
}

fn prepare_writer(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA synchronous = NORMAL;
"#,
    )
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Fresh on-disk database pair inside a temp dir that lives as long as the guard.
    pub(crate) fn temp_databases() -> (tempfile::TempDir, Databases) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sybil.db");
        let path = path.to_string_lossy().to_string();
        let dbs = Databases::open(&path, &path).expect("open databases");
        (dir, dbs)
    }
}
