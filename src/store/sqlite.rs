use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::StoreError;
use crate::model::SequenceRun;

use super::RunStore;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS sequence_runs (
     run_id TEXT PRIMARY KEY,
     instance_id TEXT NOT NULL,
     sequence_name TEXT NOT NULL,
     result TEXT NOT NULL,
     run_json TEXT NOT NULL,
     updated_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
   );
   CREATE INDEX IF NOT EXISTS sequence_runs_instance ON sequence_runs (instance_id, sequence_name);";

/// Runs stored as JSON documents, one row each, with the columns needed to
/// look them up.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }
}

fn decode(raw: String) -> Result<SequenceRun, StoreError> {
    Ok(serde_json::from_str(&raw)?)
}

impl RunStore for SqliteStore {
    fn create_run(&mut self, run: &SequenceRun) -> Result<(), StoreError> {
        let run_json = serde_json::to_string(run)?;
        self.conn.execute(
            "INSERT INTO sequence_runs (run_id, instance_id, sequence_name, result, run_json)
             VALUES (?1, ?2, ?3, ?4, ?5);",
            params![run.id, run.instance_id, run.sequence_name, run.result.as_str(), run_json],
        )?;
        Ok(())
    }

    fn save_run(&mut self, run: &SequenceRun) -> Result<(), StoreError> {
        let run_json = serde_json::to_string(run)?;
        self.conn.execute(
            "INSERT INTO sequence_runs (run_id, instance_id, sequence_name, result, run_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, strftime('%s','now'))
             ON CONFLICT(run_id)
             DO UPDATE SET
               result = excluded.result,
               run_json = excluded.run_json,
               updated_at = excluded.updated_at;",
            params![run.id, run.instance_id, run.sequence_name, run.result.as_str(), run_json],
        )?;
        Ok(())
    }

    fn load_run(&self, id: &str) -> Result<SequenceRun, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT run_json FROM sequence_runs WHERE run_id = ?1 LIMIT 1;",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(decode)
            .unwrap_or_else(|| Err(StoreError::NotFound(id.to_string())))
    }

    fn runs_for_instance(&self, instance_id: &str) -> Result<Vec<SequenceRun>, StoreError> {
        let mut statement = self
            .conn
            .prepare("SELECT run_json FROM sequence_runs WHERE instance_id = ?1 ORDER BY rowid;")?;
        let rows = statement.query_map(params![instance_id], |row| row.get::<_, String>(0))?;
        rows.map(|raw| decode(raw?)).collect()
    }

    fn latest_run(&self, instance_id: &str, sequence_name: &str) -> Result<Option<SequenceRun>, StoreError> {
        self.conn
            .query_row(
                "SELECT run_json FROM sequence_runs
                 WHERE instance_id = ?1 AND sequence_name = ?2
                 ORDER BY rowid DESC LIMIT 1;",
                params![instance_id, sequence_name],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(decode)
            .transpose()
    }
}
