//! Layout of the SQLite key-value database
//!
//! Everything lives in `kv` as `(key, JSON text, updated_at)`. The layout
//! version sits in `schema_info` so a binary never writes over a database
//! laid out by a newer release.

use rusqlite::{Connection, OptionalExtension, Result};

pub const SCHEMA_VERSION: i32 = 1;

/// What `open` found in an existing database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaState {
    /// Fresh file, or one that predates version tracking
    Missing,
    Current,
    Older(i32),
    Newer(i32),
}

impl SchemaState {
    pub fn needs_init(self) -> bool {
        matches!(self, SchemaState::Missing | SchemaState::Older(_))
    }
}

/// Create the tables and stamp the current version
///
/// Idempotent; existing rows in `kv` are kept.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );
        "#,
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

pub fn schema_state(conn: &Connection) -> Result<SchemaState> {
    let tracked = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_info'")?
        .exists([])?;
    if !tracked {
        return Ok(SchemaState::Missing);
    }

    let stamped: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_info WHERE key = 'version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    Ok(match stamped.and_then(|v| v.parse::<i32>().ok()) {
        None => SchemaState::Missing,
        Some(v) if v == SCHEMA_VERSION => SchemaState::Current,
        Some(v) if v < SCHEMA_VERSION => SchemaState::Older(v),
        Some(v) => SchemaState::Newer(v),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(conn: &Connection, version: &str) {
        conn.execute(
            "UPDATE schema_info SET value = ?1 WHERE key = 'version'",
            [version],
        )
        .unwrap();
    }

    #[test]
    fn test_fresh_database_is_initialized() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(schema_state(&conn).unwrap(), SchemaState::Missing);

        init_schema(&conn).unwrap();
        assert_eq!(schema_state(&conn).unwrap(), SchemaState::Current);
        assert!(!schema_state(&conn).unwrap().needs_init());
    }

    #[test]
    fn test_init_keeps_existing_rows() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES ('fieldsync/queue/v1', '[]', 0)",
            [],
        )
        .unwrap();

        init_schema(&conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM kv", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_version_stamps() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        stamp(&conn, "0");
        assert_eq!(schema_state(&conn).unwrap(), SchemaState::Older(0));
        assert!(schema_state(&conn).unwrap().needs_init());

        stamp(&conn, "7");
        assert_eq!(schema_state(&conn).unwrap(), SchemaState::Newer(7));
        assert!(!schema_state(&conn).unwrap().needs_init());

        stamp(&conn, "garbage");
        assert_eq!(schema_state(&conn).unwrap(), SchemaState::Missing);
    }
}
