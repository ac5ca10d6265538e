//! Schema history. Each migration brings the database from the previous
//! version to its own; a fresh database runs them all.

use rusqlite::{Connection, OptionalExtension, params};

pub const SCHEMA_VERSION: i32 = 2;

pub(super) struct Migration {
    pub version: i32,
    pub sql: &'static str,
}

pub(super) const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: "
            CREATE TABLE nodes (
                node_id INTEGER PRIMARY KEY,
                registered_at TEXT NOT NULL
            );
            CREATE TABLE static_data (
                node_id INTEGER NOT NULL REFERENCES nodes(node_id) ON DELETE CASCADE,
                stage TEXT NOT NULL,
                data BLOB NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (node_id, stage)
            );
        ",
    },
    Migration {
        version: 2,
        sql: "
            ALTER TABLE nodes ADD COLUMN failed_stage TEXT;
            ALTER TABLE nodes ADD COLUMN failure_reason TEXT;
        ",
    },
];

pub(super) fn ensure_version_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );",
    )
}

/// Stored version, 0 for a database that has never been migrated.
pub(super) fn stored_version(conn: &Connection) -> rusqlite::Result<i32> {
    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(version.unwrap_or(0))
}

pub(super) fn record_version(conn: &Connection, version: i32, now: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO schema_version (id, version, updated_at) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET version = excluded.version, updated_at = excluded.updated_at",
        params![version, now],
    )?;
    Ok(())
}
