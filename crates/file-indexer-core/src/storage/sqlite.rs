use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use chrono::NaiveDateTime;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const BUSY_TIMEOUT_MS: u32 = 5000;
const RETRY_ATTEMPTS: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Columns added after the first schema version: `(table, column, definition)`.
const ADDITIVE_COLUMNS: &[(&str, &str, &str)] = &[
    ("file_meta", "is_archived", "INTEGER DEFAULT 0"),
    ("file_meta", "archive_path", "TEXT"),
];

pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Shared store handle. One connection, serialized behind a mutex, so the
/// handle can be wrapped in an `Arc` and used from every worker.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let db = Database {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        db.configure_pragmas()?;
        db.migrate_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database {
            conn: Mutex::new(conn),
            path: None,
        };
        db.configure_pragmas()?;
        db.migrate_schema()?;
        Ok(db)
    }

    /// Opens an existing database without touching its schema. Used for
    /// merge sources, which may predate the archive columns.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS as u64))?;
        Ok(Database {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn configure_pragmas(&self) -> Result<()> {
        self.with_conn(|conn| {
            let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
            conn.execute_batch(&format!(
                "PRAGMA synchronous = NORMAL;
                 PRAGMA cache_size = -64000;
                 PRAGMA busy_timeout = {};",
                BUSY_TIMEOUT_MS
            ))?;
            debug!("SQLite pragmas configured (journal_mode={}, 64MB cache)", mode);
            Ok(())
        })
    }

    /// Creates the base tables, then applies additive column migrations.
    /// Every step inspects the current schema first, so reopening is a no-op.
    fn migrate_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(include_str!("schema.sql"))?;
            for (table, column, definition) in ADDITIVE_COLUMNS {
                if !column_exists(conn, table, column)? {
                    conn.execute_batch(&format!(
                        "ALTER TABLE {} ADD COLUMN {} {}",
                        table, column, definition
                    ))?;
                    debug!("Added column {}.{}", table, column);
                }
            }
            conn.execute_batch(
                "CREATE INDEX IF NOT EXISTS ix_file_meta_is_archived ON file_meta (is_archived);",
            )?;
            Ok(())
        })
    }

    pub fn has_column(&self, table: &str, column: &str) -> Result<bool> {
        self.with_conn(|conn| column_exists(conn, table, column))
    }

    pub fn has_table(&self, table: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        f(&mut guard)
    }

    /// Runs `op` and retries it on SQLITE_BUSY / SQLITE_LOCKED with
    /// exponential backoff. The lock is released while sleeping.
    pub(crate) fn with_retry<T>(
        &self,
        mut op: impl FnMut(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 1;
        loop {
            match self.with_conn(&mut op) {
                Err(err) if err.is_busy() && attempt < RETRY_ATTEMPTS => {
                    warn!(
                        "Database busy (attempt {}/{}), retrying in {:?}: {}",
                        attempt, RETRY_ATTEMPTS, delay, err
                    );
                    thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names.iter().any(|name| name == column))
}

pub(crate) fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Reads a DATETIME column leniently: rows written by other tools may use a
/// `T` separator or leave the value empty.
pub(crate) fn parse_timestamp(value: ValueRef<'_>) -> Option<NaiveDateTime> {
    let text = match value {
        ValueRef::Text(bytes) => std::str::from_utf8(bytes).ok()?,
        _ => return None,
    };
    let text = text.trim();
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}
