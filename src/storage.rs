// Durable key-value storage for session data
// SQLite-backed for real use, in-memory for tests and ephemeral sessions

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::StorageError;

/// Async key-value store holding serialized session records
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    /// Read the value stored under `key`, if any
    async fn get_item(&self, key: &str) -> std::result::Result<Option<String>, StorageError>;

    /// Store `value` under `key`, replacing any previous value
    async fn set_item(&self, key: &str, value: &str) -> std::result::Result<(), StorageError>;

    /// Remove `key`; removing a missing key is not an error
    async fn remove_item(&self, key: &str) -> std::result::Result<(), StorageError>;
}

/// Key-value storage in a local SQLite database
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create storage directory: {}", parent.display())
                })?;
            }
        }

        tracing::debug!("Opening session storage: {}", path.display());
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS session_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create session_kv table")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking closure against the connection off the async runtime
    async fn with_conn<T, F>(&self, f: F) -> std::result::Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StorageError::Unavailable("connection lock poisoned".to_string()))?;
            f(&guard).map_err(StorageError::from)
        })
        .await?
    }
}

#[async_trait]
impl KeyValueStorage for SqliteStorage {
    async fn get_item(&self, key: &str) -> std::result::Result<Option<String>, StorageError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM session_kv WHERE key = ?",
                [key.as_str()],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn set_item(&self, key: &str, value: &str) -> std::result::Result<(), StorageError> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO session_kv (key, value) VALUES (?1, ?2)",
                [key.as_str(), value.as_str()],
            )
            .map(|_| ())
        })
        .await
    }

    async fn remove_item(&self, key: &str) -> std::result::Result<(), StorageError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM session_kv WHERE key = ?", [key.as_str()])
                .map(|_| ())
        })
        .await
    }
}

/// Volatile storage; can be switched into a failing mode to exercise error paths
#[derive(Default)]
pub struct MemoryStorage {
    items: DashMap<String, String>,
    failing: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Raw value under `key`, bypassing the failure switch
    pub fn peek(&self, key: &str) -> Option<String> {
        self.items.get(key).map(|entry| entry.value().clone())
    }

    fn check(&self) -> std::result::Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "memory storage is in failing mode".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
    async fn get_item(&self, key: &str) -> std::result::Result<Option<String>, StorageError> {
        self.check()?;
        Ok(self.peek(key))
    }

    async fn set_item(&self, key: &str, value: &str) -> std::result::Result<(), StorageError> {
        self.check()?;
        self.items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> std::result::Result<(), StorageError> {
        self.check()?;
        self.items.remove(key);
        Ok(())
    }
}
