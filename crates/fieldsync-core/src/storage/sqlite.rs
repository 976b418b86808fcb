//! SQLite-backed key-value store

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::info;

use super::error::{StorageError, StorageResult};
use super::schema::{init_schema, schema_state, SchemaState, SCHEMA_VERSION};
use super::KeyValueStore;

/// Key-value store persisted in an embedded SQLite database
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        match schema_state(&conn)? {
            SchemaState::Newer(found) => {
                return Err(StorageError::UnsupportedSchema {
                    found,
                    supported: SCHEMA_VERSION,
                });
            }
            state if state.needs_init() => {
                info!("Initializing key-value schema ({:?})", state);
                init_schema(&conn)?;
            }
            _ => {}
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        let conn = self.lock();
        let text: Option<String> = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;

        match text {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| StorageError::InvalidFormat {
                    key: key.to_string(),
                    details: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &Value) -> StorageResult<()> {
        let text = serde_json::to_string(value)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, text, chrono::Utc::now().timestamp_millis()],
        )
        .map_err(|e| classify_write_error(e, key))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(())
    }
}

fn classify_write_error(error: rusqlite::Error, key: &str) -> StorageError {
    match error {
        rusqlite::Error::SqliteFailure(ref err, _) if err.code == rusqlite::ErrorCode::DiskFull => {
            StorageError::QuotaExceeded {
                key: key.to_string(),
            }
        }
        other => StorageError::Database(other),
    }
}
