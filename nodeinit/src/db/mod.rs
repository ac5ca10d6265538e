//! SQLite persistence for static stage results.
//!
//! One file holds the registered node set, each node's permanent failure if
//! it has one, and one row per (node, stage) for every persisted stage that
//! completed. Writes are synchronous and fully
//! synced: a result acknowledged here survives a power cut, which is what
//! lets a restart skip the stage.

mod nodes;
mod schema;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, Transaction};

use nodeinit_shared::{NodeinitError, NodeinitResult};

pub use nodes::SqliteStaticStore;
pub use schema::SCHEMA_VERSION;

/// Map rusqlite errors to `NodeinitError::Database`.
macro_rules! db_err {
    ($result:expr) => {
        $result.map_err(|e| NodeinitError::Database(e.to_string()))
    };
}

pub(crate) use db_err;

const PRAGMAS: &str = "
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=FULL;
    PRAGMA foreign_keys=ON;
    PRAGMA busy_timeout=5000;
";

/// Shared handle to the node database. Clones use the same connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open `db_path`, creating it and its directory if needed, and bring
    /// the schema up to date.
    ///
    /// # Errors
    ///
    /// `Database` if the file was written by a newer release.
    pub fn open(db_path: &Path) -> NodeinitResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = db_err!(Connection::open(db_path))?;
        db_err!(conn.execute_batch(PRAGMAS))?;
        migrate(&mut conn)?;

        tracing::debug!(path = %db_path.display(), "Opened node database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Run `f` in a transaction, committing only if it succeeds.
    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
    ) -> NodeinitResult<T> {
        let mut conn = self.conn.lock();
        let tx = db_err!(conn.transaction())?;
        let value = db_err!(f(&tx))?;
        db_err!(tx.commit())?;
        Ok(value)
    }
}

fn migrate(conn: &mut Connection) -> NodeinitResult<()> {
    db_err!(schema::ensure_version_table(conn))?;
    let stored = db_err!(schema::stored_version(conn))?;

    if stored > SCHEMA_VERSION {
        return Err(NodeinitError::Database(format!(
            "database schema version {} is newer than supported {}",
            stored, SCHEMA_VERSION
        )));
    }

    let pending = schema::MIGRATIONS.iter().filter(|m| m.version > stored);
    for migration in pending {
        let tx = db_err!(conn.transaction())?;
        db_err!(tx.execute_batch(migration.sql))?;
        db_err!(schema::record_version(
            &tx,
            migration.version,
            &Utc::now().to_rfc3339()
        ))?;
        db_err!(tx.commit())?;
        tracing::info!(from = stored, to = migration.version, "Migrated node database");
    }
    Ok(())
}
