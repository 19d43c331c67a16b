use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::{TaskRecord, TaskStore};

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `scheduled_tasks` table (idempotent). Every column is TEXT;
/// the bridge owns the encoding.
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS scheduled_tasks (
            hash          TEXT NOT NULL PRIMARY KEY,
            name          TEXT NOT NULL,
            params        TEXT NOT NULL,   -- JSON array of strings
            duration      TEXT NOT NULL,
            last_run      TEXT NOT NULL,   -- RFC 3339 or ''
            next_run      TEXT NOT NULL,   -- RFC 3339
            is_recurring  TEXT NOT NULL    -- '1' / '0'
        ) STRICT;
        ",
    )
}

/// SQLite-backed [`TaskStore`].
///
/// Wraps a single connection in a `Mutex`; `close` drops it.
pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        // WAL lets several schedulers share one file without blocking readers.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        init_db(&conn)?;
        info!(path = %path.display(), "task store opened");
        Ok(Self::new(conn))
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self::new(conn))
    }

    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
        }
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let guard = self.conn.lock().expect("sqlite store poisoned");
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        Ok(f(conn)?)
    }
}

impl TaskStore for SqliteStore {
    fn add(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let inserted = self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO scheduled_tasks
                 (hash, name, params, duration, last_run, next_run, is_recurring)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    record.hash,
                    record.name,
                    record.params,
                    record.duration,
                    record.last_run,
                    record.next_run,
                    record.is_recurring,
                ],
            )
        })?;
        if inserted > 0 {
            debug!(hash = %record.hash, name = %record.name, "task record inserted");
        }
        Ok(())
    }

    fn update(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET last_run = ?1, next_run = ?2 WHERE hash = ?3",
                rusqlite::params![record.last_run, record.next_run, record.hash],
            )
        })?;
        Ok(())
    }

    fn fetch(&self) -> Result<Vec<TaskRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT hash, name, params, duration, last_run, next_run, is_recurring
                 FROM scheduled_tasks ORDER BY next_run",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(TaskRecord {
                    hash: row.get(0)?,
                    name: row.get(1)?,
                    params: row.get(2)?,
                    duration: row.get(3)?,
                    last_run: row.get(4)?,
                    next_run: row.get(5)?,
                    is_recurring: row.get(6)?,
                })
            })?;
            let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
    }

    fn remove(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM scheduled_tasks WHERE hash = ?1",
                [&record.hash],
            )
        })?;
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("sqlite store poisoned").take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| StoreError::Database(e))?;
            info!("task store closed");
        }
        Ok(())
    }
}
