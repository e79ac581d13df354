//! SQLite-backed store for runs, discovery state, analyses and briefs.
//!
//! One store file per deployment, one writer per invocation (guarded by an
//! exclusive lock file). Store calls are synchronous; the async pipeline only
//! suspends on network I/O.

mod schema;

pub mod analysis;
pub mod briefs;
pub mod http_cache;
pub mod repos;
pub mod runs;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use rusqlite::{params, Connection};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("migration {name} failed: {message}")]
    Migration { name: String, message: String },
    #[error("store is locked by another process: {0}")]
    Locked(PathBuf),
}

#[derive(Clone)]
pub struct Store {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if needed), tune for durability, and migrate.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=FULL;\
             PRAGMA foreign_keys=ON;\
             PRAGMA busy_timeout=5000;",
        )?;
        let store = Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let store = Self {
            path: PathBuf::from(":memory:"),
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the exclusive writer lock. Held for the life of the returned
    /// guard; a second invocation fails instead of corrupting run state.
    pub fn lock_exclusive(&self) -> Result<StoreLock, StoreError> {
        StoreLock::new(&self.path)
    }

    /// Recover from mutex poisoning; the connection itself is still usable.
    pub(crate) fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    /// Run `f` inside a transaction; any error rolls back.
    pub fn transaction<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let mut guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let tx = guard.transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                // Dropping the transaction rolls back.
                Err(err)
            }
        }
    }

    /// Apply any pending migration scripts. Idempotent: scripts already in
    /// `schema_migrations` are skipped, so re-running on a fully migrated
    /// store is a no-op.
    pub fn migrate(&self) -> Result<Vec<String>, StoreError> {
        let mut guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
               name TEXT PRIMARY KEY,
               applied_at INTEGER NOT NULL
             );",
        )?;

        let mut applied = Vec::new();
        for (name, sql) in schema::MIGRATIONS {
            let already: bool = guard
                .query_row(
                    "SELECT COUNT(*) FROM schema_migrations WHERE name = ?1",
                    params![name],
                    |row| row.get::<_, i64>(0),
                )
                .map(|n| n > 0)?;
            if already {
                continue;
            }
            let tx = guard.transaction()?;
            tx.execute_batch(sql).map_err(|e| StoreError::Migration {
                name: name.to_string(),
                message: e.to_string(),
            })?;
            tx.execute(
                "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, ?2)",
                params![name, now_epoch_ms()],
            )?;
            tx.commit()?;
            applied.push(name.to_string());
        }
        Ok(applied)
    }

    /// Names of applied migrations, in application order.
    pub fn applied_migrations(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT name FROM schema_migrations ORDER BY applied_at, name")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
    }

    pub fn vacuum(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch("VACUUM;")?;
            Ok(())
        })
    }
}

/// Exclusive advisory lock next to the store file (`<db>.lock`).
#[derive(Debug)]
pub struct StoreLock {
    _file: std::fs::File,
}

impl StoreLock {
    fn new(db_path: &Path) -> Result<Self, StoreError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)?;
        file.try_lock_exclusive()
            .map_err(|_| StoreError::Locked(lock_path))?;
        Ok(Self { _file: file })
    }
}

pub(crate) fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
