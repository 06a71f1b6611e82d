//! Session snapshot store.

use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use tracing::warn;

use super::record::SessionRecord;
use crate::store::SessionId;

/// Data access object for persisted session snapshots.
#[derive(Clone)]
pub struct SessionSnapshotStore {
    conn: Arc<Mutex<Connection>>,
}

impl SessionSnapshotStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Insert or replace a session snapshot.
    pub fn upsert(&self, record: &SessionRecord) -> SqliteResult<()> {
        let conn = self.conn.lock().unwrap();
        let tabs = serialize_json(&record.tabs, "tabs");
        let queue = serialize_json(&record.queue, "queue");
        let slash_commands = serialize_json(&record.slash_commands, "slash_commands");
        let remote = record
            .remote
            .as_ref()
            .map(|r| serialize_json(r, "remote"));
        let now = chrono::Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO sessions (id, tool_type, working_dir, active_tab_id, input_mode, remote, tabs, queue, slash_commands, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
               tool_type = excluded.tool_type,
               working_dir = excluded.working_dir,
               active_tab_id = excluded.active_tab_id,
               input_mode = excluded.input_mode,
               remote = excluded.remote,
               tabs = excluded.tabs,
               queue = excluded.queue,
               slash_commands = excluded.slash_commands,
               updated_at = excluded.updated_at",
            params![
                record.id.as_str(),
                record.tool_type.as_str(),
                record.working_dir.to_string_lossy().into_owned(),
                record.active_tab_id.as_str(),
                serde_json::to_string(&record.input_mode)
                    .unwrap_or_else(|_| "\"agent\"".to_string()),
                remote,
                tabs,
                queue,
                slash_commands,
                record.created_at.to_rfc3339(),
                now,
            ],
        )?;
        Ok(())
    }

    /// Load all persisted snapshots, oldest first.
    pub fn load_all(&self) -> SqliteResult<Vec<SessionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tool_type, working_dir, active_tab_id, input_mode, remote, tabs, queue, slash_commands, created_at
             FROM sessions ORDER BY created_at",
        )?;

        let records = stmt
            .query_map([], Self::row_to_record)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(records)
    }

    pub fn get(&self, id: &SessionId) -> SqliteResult<Option<SessionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tool_type, working_dir, active_tab_id, input_mode, remote, tabs, queue, slash_commands, created_at
             FROM sessions WHERE id = ?1",
        )?;
        stmt.query_row(params![id.as_str()], Self::row_to_record)
            .optional()
    }

    pub fn delete(&self, id: &SessionId) -> SqliteResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM sessions WHERE id = ?1", params![id.as_str()])?;
        Ok(())
    }

    pub fn count(&self) -> SqliteResult<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn row_to_record(row: &rusqlite::Row) -> SqliteResult<SessionRecord> {
        let id: String = row.get("id")?;
        let tool_type: String = row.get("tool_type")?;
        let working_dir: String = row.get("working_dir")?;
        let active_tab_id: String = row.get("active_tab_id")?;
        let input_mode: String = row.get("input_mode")?;
        let remote: Option<String> = row.get("remote")?;
        let tabs: String = row.get("tabs")?;
        let queue: String = row.get("queue")?;
        let slash_commands: String = row.get("slash_commands")?;
        let created_at: String = row.get("created_at")?;

        Ok(SessionRecord {
            id: SessionId::from_string(id),
            tool_type: crate::host::ToolType::parse(&tool_type),
            working_dir: working_dir.into(),
            active_tab_id: crate::store::TabId::from_string(active_tab_id),
            input_mode: serde_json::from_str(&input_mode).unwrap_or_default(),
            remote: remote.and_then(|r| deserialize_json(&r, "remote")),
            tabs: deserialize_json(&tabs, "tabs").unwrap_or_default(),
            queue: deserialize_json(&queue, "queue").unwrap_or_default(),
            slash_commands: deserialize_json(&slash_commands, "slash_commands")
                .unwrap_or_default(),
            created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .unwrap_or_else(|_| chrono::Utc::now()),
        })
    }
}

fn serialize_json<T: serde::Serialize>(value: &T, field: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        warn!(error = %e, field, "Failed to serialize session field");
        "[]".to_string()
    })
}

fn deserialize_json<T: serde::de::DeserializeOwned>(raw: &str, field: &str) -> Option<T> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, field, "Failed to deserialize session field");
            None
        }
    }
}
