// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! SQLite persistence for bus messages and agent records.
//!
//! One database file holds both tables, so a restarted process can replay
//! conversation history and rebuild the agent hierarchy.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::agents::types::{AgentRecord, AgentRole, AgentStatus};
use crate::bus::types::{BusMessage, HistoryFilter, HistoryPage, MessageType};
use crate::error::StoreError;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Default database location for a project.
pub fn default_db_path(project_root: &Path) -> PathBuf {
    project_root.join(".foreman").join("foreman.db")
}

/// SQLite store shared by the bus and the agent registry.
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open or create a database file.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self {
            conn: Mutex::new(conn),
            path: Some(db_path.to_path_buf()),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Database file path, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                from_agent TEXT,
                to_agent TEXT,
                message_type TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL,
                conversation_id TEXT,
                correlation_id TEXT,
                timestamp INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                role TEXT NOT NULL,
                parent_id TEXT,
                status TEXT NOT NULL,
                name TEXT,
                model TEXT,
                provider TEXT,
                workspace_path TEXT,
                project_id TEXT,
                coding_agent TEXT,
                specialty TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, seq);
            CREATE INDEX IF NOT EXISTS idx_messages_from ON messages(from_agent, seq);
            CREATE INDEX IF NOT EXISTS idx_messages_to ON messages(to_agent, seq);
            CREATE INDEX IF NOT EXISTS idx_agents_parent ON agents(parent_id);
            "#,
        )?;

        let current: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        if current.is_none() {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?)",
                params![SCHEMA_VERSION],
            )?;
        }
        Ok(())
    }

    // ---- messages ----

    /// Append a message. Message ids are unique; re-inserting one fails.
    pub fn insert_message(&self, msg: &BusMessage) -> Result<(), StoreError> {
        let metadata = serde_json::to_string(&msg.metadata)?;
        self.conn().execute(
            r#"
            INSERT INTO messages (
                id, from_agent, to_agent, message_type, content, metadata,
                conversation_id, correlation_id, timestamp
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                msg.id,
                msg.from_agent_id,
                msg.to_agent_id,
                msg.message_type.as_str(),
                msg.content,
                metadata,
                msg.conversation_id,
                msg.correlation_id,
                msg.timestamp.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Fetch a message by id.
    pub fn get_message(&self, id: &str) -> Result<Option<BusMessage>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, from_agent, to_agent, message_type, content, metadata,
                        conversation_id, correlation_id, timestamp
                 FROM messages WHERE id = ?",
                params![id],
                message_from_row,
            )
            .optional()?;
        row.transpose()
    }

    /// Query history in insertion order.
    pub fn history(&self, filter: &HistoryFilter) -> Result<HistoryPage, StoreError> {
        let page_size = filter.page_size();
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, from_agent, to_agent, message_type, content, metadata,
                   conversation_id, correlation_id, timestamp
            FROM messages
            WHERE (?1 IS NULL OR from_agent = ?1 OR to_agent = ?1)
              AND (?2 IS NULL OR conversation_id = ?2)
              AND (?3 IS NULL OR message_type = ?3)
            ORDER BY seq ASC
            LIMIT ?4 OFFSET ?5
            "#,
        )?;

        let rows = stmt.query_map(
            params![
                filter.agent_id,
                filter.conversation_id,
                filter.message_type.map(|t| t.as_str()),
                (page_size + 1) as i64,
                filter.offset as i64,
            ],
            message_from_row,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row??);
        }
        let has_more = messages.len() > page_size;
        messages.truncate(page_size);
        debug!(count = messages.len(), has_more, "Loaded message history");
        Ok(HistoryPage { messages, has_more })
    }

    /// Total number of stored messages.
    pub fn message_count(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ---- agents ----

    /// Insert or replace an agent record.
    pub fn upsert_agent(&self, agent: &AgentRecord) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO agents (
                id, role, parent_id, status, name, model, provider, workspace_path,
                project_id, coding_agent, specialty, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                role = excluded.role,
                parent_id = excluded.parent_id,
                status = excluded.status,
                name = excluded.name,
                model = excluded.model,
                provider = excluded.provider,
                workspace_path = excluded.workspace_path,
                project_id = excluded.project_id,
                coding_agent = excluded.coding_agent,
                specialty = excluded.specialty,
                updated_at = excluded.updated_at
            "#,
            params![
                agent.id,
                agent.role.as_str(),
                agent.parent_id,
                agent.status.as_str(),
                agent.name,
                agent.model,
                agent.provider,
                agent
                    .workspace_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().to_string()),
                agent.project_id,
                agent.coding_agent,
                agent.specialty,
                agent.created_at.timestamp_millis(),
                agent.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Fetch an agent by id.
    pub fn get_agent(&self, id: &str) -> Result<Option<AgentRecord>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("{} WHERE id = ?", AGENT_SELECT),
                params![id],
                agent_from_row,
            )
            .optional()?;
        row.transpose()
    }

    /// All agents in creation order.
    pub fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{} ORDER BY created_at ASC, id ASC", AGENT_SELECT))?;
        let rows = stmt.query_map([], agent_from_row)?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row??);
        }
        Ok(agents)
    }
}

const AGENT_SELECT: &str = "SELECT id, role, parent_id, status, name, model, provider, \
     workspace_path, project_id, coding_agent, specialty, created_at, updated_at FROM agents";

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Result<BusMessage, StoreError>> {
    let type_str: String = row.get(3)?;
    let metadata_str: String = row.get(5)?;
    let message_type = match MessageType::parse(&type_str) {
        Some(t) => t,
        None => {
            return Ok(Err(StoreError::Serialization(format!(
                "unknown message type: {}",
                type_str
            ))))
        }
    };
    let metadata = match serde_json::from_str(&metadata_str) {
        Ok(m) => m,
        Err(e) => return Ok(Err(e.into())),
    };
    Ok(Ok(BusMessage {
        id: row.get(0)?,
        from_agent_id: row.get(1)?,
        to_agent_id: row.get(2)?,
        message_type,
        content: row.get(4)?,
        metadata,
        conversation_id: row.get(6)?,
        correlation_id: row.get(7)?,
        timestamp: millis_to_datetime(row.get(8)?),
    }))
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Result<AgentRecord, StoreError>> {
    let role_str: String = row.get(1)?;
    let status_str: String = row.get(3)?;
    let (Some(role), Some(status)) = (AgentRole::parse(&role_str), AgentStatus::parse(&status_str))
    else {
        return Ok(Err(StoreError::Serialization(format!(
            "invalid agent row: role={} status={}",
            role_str, status_str
        ))));
    };
    let workspace: Option<String> = row.get(7)?;
    Ok(Ok(AgentRecord {
        id: row.get(0)?,
        role,
        parent_id: row.get(2)?,
        status,
        name: row.get(4)?,
        model: row.get(5)?,
        provider: row.get(6)?,
        workspace_path: workspace.map(PathBuf::from),
        project_id: row.get(8)?,
        coding_agent: row.get(9)?,
        specialty: row.get(10)?,
        created_at: millis_to_datetime(row.get(11)?),
        updated_at: millis_to_datetime(row.get(12)?),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sent(mut msg: BusMessage, id: &str) -> BusMessage {
        msg.id = id.to_string();
        msg
    }

    #[test]
    fn test_history_pagination() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..5 {
            let msg = BusMessage::chat(None, Some("coo"), format!("m{}", i))
                .with_conversation(Some("c1"));
            store.insert_message(&sent(msg, &format!("id-{}", i))).unwrap();
        }

        let page = store
            .history(&HistoryFilter::conversation("c1").with_limit(2))
            .unwrap();
        assert!(page.has_more);
        assert_eq!(
            page.messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["m0", "m1"]
        );

        let last = store
            .history(&HistoryFilter::conversation("c1").with_limit(2).with_offset(4))
            .unwrap();
        assert!(!last.has_more);
        assert_eq!(last.messages.len(), 1);
        assert_eq!(last.messages[0].content, "m4");
    }

    #[test]
    fn test_zero_limit_pages_make_progress() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..3 {
            let msg = BusMessage::chat(None, Some("coo"), format!("m{}", i))
                .with_conversation(Some("c1"));
            store.insert_message(&sent(msg, &format!("id-{}", i))).unwrap();
        }

        let page = store
            .history(&HistoryFilter::conversation("c1").with_limit(0))
            .unwrap();
        assert_eq!(page.messages.len(), 3);
        assert!(!page.has_more);
    }

    #[test]
    fn test_history_filters() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_message(&sent(BusMessage::directive(Some("lead"), "w1", "task"), "a"))
            .unwrap();
        store
            .insert_message(&sent(
                BusMessage::report("w1", Some("lead"), "done", Some("a")),
                "b",
            ))
            .unwrap();
        store
            .insert_message(&sent(BusMessage::status("w2", "idle"), "c"))
            .unwrap();

        let w1 = store.history(&HistoryFilter::agent("w1")).unwrap();
        assert_eq!(w1.messages.len(), 2);

        let reports = store
            .history(&HistoryFilter {
                message_type: Some(MessageType::Report),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(reports.messages.len(), 1);
        assert_eq!(reports.messages[0].correlation_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_duplicate_message_id_rejected() {
        let store = Store::open_in_memory().unwrap();
        let msg = sent(BusMessage::status("w1", "x"), "dup");
        store.insert_message(&msg).unwrap();
        assert!(store.insert_message(&msg).is_err());
        assert_eq!(store.message_count().unwrap(), 1);
    }

    #[test]
    fn test_agents_persist_across_reopen() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("nested").join("foreman.db");

        let mut agent = AgentRecord::new(AgentRole::Worker, Some("lead"))
            .with_workspace("/repo")
            .with_coding_agent(Some("codex".into()));
        {
            let store = Store::open(&db).unwrap();
            store.upsert_agent(&agent).unwrap();
            agent.status = AgentStatus::Busy;
            store.upsert_agent(&agent).unwrap();
        }

        let store = Store::open(&db).unwrap();
        let loaded = store.get_agent(&agent.id).unwrap().unwrap();
        assert_eq!(loaded.status, AgentStatus::Busy);
        assert_eq!(loaded.workspace_path, Some(PathBuf::from("/repo")));
        assert_eq!(loaded.coding_agent.as_deref(), Some("codex"));
        assert_eq!(store.list_agents().unwrap().len(), 1);
    }

    #[test]
    fn test_metadata_preserved() {
        let store = Store::open_in_memory().unwrap();
        let msg = sent(
            BusMessage::report("w1", Some("lead"), "ok", None)
                .with_metadata("diff", serde_json::json!([{"path": "a.rs"}])),
            "m",
        );
        store.insert_message(&msg).unwrap();
        let loaded = store.get_message("m").unwrap().unwrap();
        assert_eq!(loaded.metadata["diff"][0]["path"], "a.rs");
    }
}
