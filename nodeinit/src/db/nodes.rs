//! SQLite-backed [`StaticDataStore`].

use super::{Database, db_err};
use crate::catalog::{Stage, StaticData};
use crate::store::{StaticDataStore, StoredFailure};
use chrono::Utc;
use nodeinit_shared::{NodeId, NodeinitError, NodeinitResult};
use rusqlite::{OptionalExtension, params};

#[derive(Clone)]
pub struct SqliteStaticStore {
    db: Database,
}

impl SqliteStaticStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl StaticDataStore for SqliteStaticStore {
    fn load(&self, node: NodeId) -> NodeinitResult<StaticData> {
        let conn = self.db.conn();
        let mut stmt = db_err!(
            conn.prepare("SELECT stage, data FROM static_data WHERE node_id = ?1 ORDER BY stage")
        )?;
        let rows = db_err!(stmt.query_map(params![node.get()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        }))?;

        let mut data = StaticData::new();
        for row in rows {
            let (stage, blob) = db_err!(row)?;
            match stage.parse::<Stage>() {
                Ok(stage) => {
                    data.insert(stage, blob);
                }
                Err(e) => {
                    tracing::warn!(node_id = %node, stage = %stage, error = %e, "Ignoring stored result for unknown stage");
                }
            }
        }
        Ok(data)
    }

    fn save(&self, node: NodeId, stage: Stage, data: &[u8]) -> NodeinitResult<()> {
        let now = Utc::now().to_rfc3339();
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO nodes (node_id, registered_at) VALUES (?1, ?2)",
                params![node.get(), now],
            )?;
            tx.execute(
                "INSERT INTO static_data (node_id, stage, data, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(node_id, stage) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
                params![node.get(), stage.as_str(), data, now],
            )
        })?;

        tracing::debug!(node_id = %node, stage = %stage, bytes = data.len(), "Saved static data");
        Ok(())
    }

    fn clear(&self, node: NodeId) -> NodeinitResult<()> {
        // Static rows go with the node through the cascade.
        let removed = self.db.with_tx(|tx| {
            tx.execute("DELETE FROM nodes WHERE node_id = ?1", params![node.get()])
        })?;
        tracing::debug!(node_id = %node, removed, "Cleared static data");
        Ok(())
    }

    fn mark_failed(&self, node: NodeId, failure: &StoredFailure) -> NodeinitResult<()> {
        let conn = self.db.conn();
        db_err!(conn.execute(
            "INSERT INTO nodes (node_id, registered_at, failed_stage, failure_reason) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(node_id) DO UPDATE SET failed_stage = excluded.failed_stage, failure_reason = excluded.failure_reason",
            params![
                node.get(),
                Utc::now().to_rfc3339(),
                failure.stage.as_str(),
                failure.reason
            ],
        ))?;
        tracing::debug!(node_id = %node, stage = %failure.stage, "Recorded node failure");
        Ok(())
    }

    fn load_failure(&self, node: NodeId) -> NodeinitResult<Option<StoredFailure>> {
        let conn = self.db.conn();
        let row = db_err!(
            conn.query_row(
                "SELECT failed_stage, failure_reason FROM nodes
                 WHERE node_id = ?1 AND failed_stage IS NOT NULL",
                params![node.get()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()
        )?;

        let Some((stage, reason)) = row else {
            return Ok(None);
        };
        let stage = stage.parse::<Stage>().map_err(|e| {
            NodeinitError::Database(format!("node {} failed at unknown stage: {}", node, e))
        })?;
        Ok(Some(StoredFailure {
            stage,
            reason: reason.unwrap_or_default(),
        }))
    }

    fn register(&self, node: NodeId) -> NodeinitResult<()> {
        let conn = self.db.conn();
        db_err!(conn.execute(
            "INSERT OR IGNORE INTO nodes (node_id, registered_at) VALUES (?1, ?2)",
            params![node.get(), Utc::now().to_rfc3339()],
        ))?;
        Ok(())
    }

    fn list_nodes(&self) -> NodeinitResult<Vec<NodeId>> {
        let conn = self.db.conn();
        let mut stmt = db_err!(conn.prepare("SELECT node_id FROM nodes ORDER BY node_id"))?;
        let rows = db_err!(stmt.query_map([], |row| row.get::<_, i64>(0)))?;

        let mut nodes = Vec::new();
        for row in rows {
            let raw = db_err!(row)?;
            let id = u16::try_from(raw).map_err(|_| {
                NodeinitError::Database(format!("node id {} out of range", raw))
            })?;
            nodes.push(NodeId::new(id));
        }
        Ok(nodes)
    }
}
