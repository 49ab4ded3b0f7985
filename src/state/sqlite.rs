use super::types::InstanceRecord;
use super::StateStore;
use crate::error::{Error, Result};
use crate::instance::Params;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio_rusqlite::Connection;
use tracing::{debug, info, warn};

const SCHEMA_VERSION: i32 = 1;
const MEMORY_LOCATION: &str = ":memory:";

/// Raw row as read from the `instances` table, decoded outside the
/// connection thread.
type RawRow = (
    String,
    String,
    String,
    String,
    u16,
    String,
    Option<u32>,
    Option<String>,
    String,
);

/// SQLite-backed [`StateStore`].
///
/// Uses an advisory lock file (`<path>.lock`) to flag concurrent writers. The
/// lock is held until [`StateStore::close`] or drop.
pub struct SqliteStateStore {
    db_path: PathBuf,
    conn: Mutex<Option<Connection>>,
    /// Advisory lock handle; `None` when another process already holds it
    lock_file: Mutex<Option<std::fs::File>>,
}

impl SqliteStateStore {
    /// Open (creating if needed) the database at `path`.
    #[tracing::instrument(skip(path), fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Filesystem(format!(
                    "Failed to create state directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let lock_file = Self::try_acquire_lock(&lock_path_for(path))?;

        let conn = Connection::open(path).await?;
        conn.call(|conn: &mut rusqlite::Connection| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "busy_timeout", 5000)?;
            Ok(())
        })
        .await?;

        let store = Self {
            db_path: path.to_path_buf(),
            conn: Mutex::new(Some(conn)),
            lock_file: Mutex::new(lock_file),
        };
        store.initialize().await?;
        debug!("Opened state store at {}", path.display());
        Ok(store)
    }

    /// In-memory store with no file lock. Records vanish on close.
    pub async fn new_ephemeral() -> Result<Self> {
        let conn = Connection::open(MEMORY_LOCATION).await?;
        conn.call(|conn: &mut rusqlite::Connection| {
            conn.pragma_update(None, "busy_timeout", 5000)?;
            Ok(())
        })
        .await?;

        let store = Self {
            db_path: PathBuf::from(MEMORY_LOCATION),
            conn: Mutex::new(Some(conn)),
            lock_file: Mutex::new(None),
        };
        store.initialize().await?;
        Ok(store)
    }

    /// Try to acquire the advisory lock.
    ///
    /// Returns `None` (and proceeds) if another process holds it.
    fn try_acquire_lock(lock_path: &Path) -> Result<Option<std::fs::File>> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|e| Error::Filesystem(format!("Failed to open lock file: {}", e)))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                let _ = file.set_len(0);
                let _ = writeln!(file, "{}", std::process::id());
                debug!("Acquired advisory lock on {:?}", lock_path);
                Ok(Some(file))
            }
            Err(e) => {
                debug!("Lock acquisition failed: {} (kind: {:?})", e, e.kind());
                let owner = std::fs::read_to_string(lock_path)
                    .ok()
                    .and_then(|c| c.trim().parse::<u32>().ok());
                match owner {
                    Some(pid) if pid == std::process::id() => {
                        debug!("Lock held by this process (store reopened)");
                    }
                    Some(pid) if crate::instance::is_pid_alive(pid) => {
                        warn!(
                            "Another supervisor (PID {}) is using {}. \
                             Proceeding anyway, but records may be overwritten.",
                            pid,
                            lock_path.display()
                        );
                    }
                    Some(pid) => {
                        debug!("Stale lock file (PID {} no longer exists) - proceeding", pid);
                    }
                    None => debug!("Could not acquire lock ({}) - proceeding anyway", e),
                }
                Ok(None)
            }
        }
    }

    fn connection(&self) -> Result<Connection> {
        self.conn
            .lock()
            .clone()
            .ok_or_else(|| Error::StoreClosed(self.db_path.display().to_string()))
    }

    async fn initialize(&self) -> Result<()> {
        let conn = self.connection()?;
        let version = conn
            .call(|conn: &mut rusqlite::Connection| {
                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS schema_version (
                        version INTEGER PRIMARY KEY,
                        applied_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS instances (
                        id TEXT PRIMARY KEY,
                        kind TEXT NOT NULL,
                        params TEXT NOT NULL,
                        host TEXT NOT NULL,
                        port INTEGER NOT NULL,
                        config_path TEXT NOT NULL,
                        pid INTEGER,
                        started_at TEXT,
                        created_at TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_instances_port ON instances(port);
                    "#,
                )?;
                let version: Option<i32> =
                    conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                        row.get(0)
                    })?;
                if version.is_none() {
                    conn.execute(
                        "INSERT INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
                        rusqlite::params![SCHEMA_VERSION],
                    )?;
                }
                Ok(version.unwrap_or(SCHEMA_VERSION))
            })
            .await?;

        if version > SCHEMA_VERSION {
            return Err(Error::Config(format!(
                "State store {} has schema version {}, newer than supported version {}",
                self.db_path.display(),
                version,
                SCHEMA_VERSION
            )));
        }
        Ok(())
    }

    /// Run `f` inside a transaction and commit.
    async fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.connection()?
            .call(move |conn: &mut rusqlite::Connection| {
                let tx = conn.transaction()?;
                let result = f(&tx)?;
                tx.commit()?;
                Ok(result)
            })
            .await
            .map_err(Error::from)
    }

    fn decode_row(row: RawRow) -> Result<InstanceRecord> {
        let (id, kind, params, host, port, config_path, pid, started_at, created_at) = row;
        let params: Params = serde_json::from_str(&params)?;
        let parse_time = |s: &str| {
            s.parse::<DateTime<Utc>>()
                .map_err(|e| Error::Config(format!("Invalid timestamp '{}' for '{}': {}", s, id, e)))
        };
        Ok(InstanceRecord {
            started_at: started_at.as_deref().map(parse_time).transpose()?,
            created_at: parse_time(&created_at)?,
            id,
            kind,
            params,
            host,
            port,
            config_path: PathBuf::from(config_path),
            pid,
        })
    }
}

fn lock_path_for(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load_all(&self) -> Result<Vec<InstanceRecord>> {
        let rows: Vec<RawRow> = self
            .connection()?
            .call(|conn: &mut rusqlite::Connection| {
                let mut stmt = conn.prepare(
                    "SELECT id, kind, params, host, port, config_path, pid, started_at, created_at \
                     FROM instances ORDER BY created_at, id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                            row.get(8)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<RawRow>>>()?;
                Ok(rows)
            })
            .await?;

        // Any undecodable row fails the whole load
        rows.into_iter()
            .map(|row| {
                let id = row.0.clone();
                Self::decode_row(row).map_err(|e| Error::CorruptRecord {
                    id,
                    location: self.db_path.display().to_string(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    async fn put(&self, record: &InstanceRecord) -> Result<()> {
        let params = serde_json::to_string(&record.params)?;
        let record = record.clone();
        self.with_transaction(move |tx| {
            tx.execute(
                "INSERT INTO instances (id, kind, params, host, port, config_path, pid, started_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    kind = excluded.kind,
                    params = excluded.params,
                    host = excluded.host,
                    port = excluded.port,
                    config_path = excluded.config_path,
                    pid = excluded.pid,
                    started_at = excluded.started_at",
                rusqlite::params![
                    record.id,
                    record.kind,
                    params,
                    record.host,
                    record.port,
                    record.config_path.to_string_lossy().into_owned(),
                    record.pid,
                    record.started_at.map(|t| t.to_rfc3339()),
                    record.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_transaction(move |tx| {
            tx.execute("DELETE FROM instances WHERE id = ?1", rusqlite::params![id])?;
            Ok(())
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        self.with_transaction(|tx| {
            tx.execute("DELETE FROM instances", [])?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            conn.close().await?;
            info!("Closed state store at {}", self.db_path.display());
        }
        if let Some(file) = self.lock_file.lock().take() {
            let _ = FileExt::unlock(&file);
        }
        Ok(())
    }

    fn location(&self) -> &Path {
        &self.db_path
    }
}
