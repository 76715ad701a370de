//! Embedded SQLite implementation of the durable usage store.
//!
//! WAL journaling keeps writers from blocking the direct-read queries, and
//! rows are soft-deleted: every query filters `deleted_at IS NULL` so an
//! operator can retract entries without rewriting history.

use std::path::Path;

use anyhow::Context;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::store::{Direction, UsageEntry, UsageStore, UsageSummary};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS usage_entries (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id           TEXT    NOT NULL,
    api_key_id        TEXT,
    service_id        TEXT    NOT NULL,
    prompt_tokens     INTEGER NOT NULL,
    completion_tokens INTEGER NOT NULL,
    direction         TEXT    NOT NULL,
    memo              TEXT    NOT NULL DEFAULT '',
    created_at        INTEGER NOT NULL,
    deleted_at        INTEGER
);

CREATE INDEX IF NOT EXISTS idx_usage_user_created
    ON usage_entries (user_id, created_at DESC);
"#;

/// SQLite-backed [`UsageStore`] with a connection pool.
pub struct SqliteStore {
    pool: r2d2::Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create ledger directory {}", parent.display()))?;
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
        });

        let pool = r2d2::Pool::builder()
            .max_size(100)
            .min_idle(Some(10))
            .build(manager)
            .context("failed to create SQLite connection pool")?;

        let conn = pool.get()?;
        conn.execute_batch(SCHEMA).context("failed to initialize ledger schema")?;

        Ok(Self { pool })
    }

    /// An in-memory store for tests.
    pub fn in_memory() -> anyhow::Result<Self> {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static NEXT_DB: AtomicUsize = AtomicUsize::new(0);
        let name = NEXT_DB.fetch_add(1, Ordering::Relaxed);

        // A shared-cache URI keeps all pooled connections on one database;
        // the counter keeps separate stores from sharing state.
        let manager = SqliteConnectionManager::file(format!("file:ledger_mem_{name}?mode=memory&cache=shared"))
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI,
            );

        let pool = r2d2::Pool::builder().max_size(4).build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self { pool })
    }
}

impl UsageStore for SqliteStore {
    fn record_batch(&self, entries: &[UsageEntry]) -> anyhow::Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        {
            let mut statement = tx.prepare_cached(
                "INSERT INTO usage_entries \
                 (user_id, api_key_id, service_id, prompt_tokens, completion_tokens, direction, memo, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;

            for entry in entries {
                statement.execute(params![
                    entry.user_id,
                    entry.api_key_id,
                    entry.service_id,
                    entry.prompt_tokens,
                    entry.completion_tokens,
                    entry.direction.as_str(),
                    entry.memo,
                    entry.created_at,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn summary(&self, user_id: &str) -> anyhow::Result<UsageSummary> {
        let conn = self.pool.get()?;

        let mut statement = conn.prepare_cached(
            "SELECT direction, COALESCE(SUM(prompt_tokens + completion_tokens), 0) \
             FROM usage_entries \
             WHERE user_id = ?1 AND deleted_at IS NULL \
             GROUP BY direction",
        )?;

        let mut summary = UsageSummary::default();
        let mut rows = statement.query(params![user_id])?;

        while let Some(row) = rows.next()? {
            let direction: String = row.get(0)?;
            let total: i64 = row.get(1)?;

            match Direction::parse(&direction) {
                Some(Direction::Consume) => summary.consumed = total,
                Some(Direction::Supply) => summary.supplied = total,
                None => log::warn!("ignoring usage rows with unknown direction '{direction}'"),
            }
        }

        summary.net = summary.supplied - summary.consumed;
        Ok(summary)
    }

    fn recent(&self, user_id: &str, limit: usize) -> anyhow::Result<Vec<UsageEntry>> {
        let conn = self.pool.get()?;

        let mut statement = conn.prepare_cached(
            "SELECT user_id, api_key_id, service_id, prompt_tokens, completion_tokens, direction, memo, created_at \
             FROM usage_entries \
             WHERE user_id = ?1 AND deleted_at IS NULL \
             ORDER BY created_at DESC, id DESC \
             LIMIT ?2",
        )?;

        let rows = statement.query_map(params![user_id, limit as i64], |row| {
            let direction: String = row.get(5)?;

            Ok(UsageEntry {
                user_id: row.get(0)?,
                api_key_id: row.get(1)?,
                service_id: row.get(2)?,
                prompt_tokens: row.get(3)?,
                completion_tokens: row.get(4)?,
                direction: Direction::parse(&direction).unwrap_or(Direction::Consume),
                memo: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }

        Ok(entries)
    }

    fn close(&self) -> anyhow::Result<()> {
        // Pooled connections flush on drop; WAL needs no explicit checkpoint
        // here beyond what SQLite does at close.
        Ok(())
    }
}
