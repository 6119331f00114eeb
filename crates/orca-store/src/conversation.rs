// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message kinds stored in a conversation transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Assistant,
    ToolCall,
    ToolResult,
    Streaming,
    Loading,
    AgentActivity,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Streaming => "streaming",
            Self::Loading => "loading",
            Self::AgentActivity => "agent_activity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool_call" => Some(Self::ToolCall),
            "tool_result" => Some(Self::ToolResult),
            "streaming" => Some(Self::Streaming),
            "loading" => Some(Self::Loading),
            "agent_activity" => Some(Self::AgentActivity),
            _ => None,
        }
    }
}

/// Token usage persisted with a message.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageRecord {
    #[serde(rename = "inputTokens")]
    pub input_tokens: u64,
    #[serde(rename = "outputTokens")]
    pub output_tokens: u64,
    #[serde(rename = "totalTokens")]
    pub total_tokens: u64,
}

/// A message about to be saved.  The store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: String,
    /// Rendered generation lineage of the producing agent ("0", "0.1", …).
    pub generation: String,
    pub kind: MessageKind,
    pub content: String,
    /// Serialized tool-call array for assistant messages that request tools.
    pub tool_calls: Option<Value>,
    pub context_size: Option<usize>,
    pub usage: Option<UsageRecord>,
}

impl NewMessage {
    pub fn text(session_id: &str, generation: &str, kind: MessageKind, content: &str) -> Self {
        Self {
            session_id: session_id.into(),
            generation: generation.into(),
            kind,
            content: content.into(),
            tool_calls: None,
            context_size: None,
            usage: None,
        }
    }
}

/// One persisted conversation message.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub generation: String,
    pub role: MessageKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "contextSize", skip_serializing_if = "Option::is_none")]
    pub context_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageRecord>,
}

/// A recorded context handoff.
#[derive(Debug, Clone)]
pub struct HandoffRecord {
    pub id: i64,
    pub session_id: String,
    pub generation: String,
    pub compressed_context: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-session conversation transcript backed by durable storage.
///
/// Writes within a session are serialized by the connection lock (which also
/// makes assigned timestamps non-decreasing); reads may run from any task.
pub struct ConversationStore {
    conn: Mutex<Connection>,
}

impl ConversationStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open conversation store: {}", db_path.display()))?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS conversation_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                generation TEXT NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                tool_calls TEXT,
                context_size INTEGER,
                usage TEXT,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS handoffs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                generation TEXT NOT NULL,
                compressed_context TEXT NOT NULL,
                reason TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_session ON conversation_messages(session_id);
            CREATE INDEX IF NOT EXISTS idx_messages_generation
                ON conversation_messages(session_id, generation);
            CREATE INDEX IF NOT EXISTS idx_handoffs_session ON handoffs(session_id);
            "#,
        )?;
        Ok(())
    }

    /// Persist one message.  Returns only after the row is durable.
    pub fn save_message(&self, msg: &NewMessage) -> Result<i64> {
        let tool_calls = msg
            .tool_calls
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize tool calls")?;
        let usage = msg
            .usage
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize usage")?;
        let conn = self.conn.lock().unwrap();
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        conn.execute(
            "INSERT INTO conversation_messages
                (session_id, generation, kind, content, tool_calls, context_size, usage, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                msg.session_id,
                msg.generation,
                msg.kind.as_str(),
                msg.content,
                tool_calls,
                msg.context_size.map(|c| c as i64),
                usage,
                ts,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Conversation history, oldest first.  When `limit` is given, the most
    /// recent `limit` messages are returned, still oldest first, because
    /// the model consumes them as a chat transcript.
    pub fn get_conversation_history(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut messages = match limit {
            Some(n) => {
                let mut stmt = conn.prepare(
                    "SELECT id, session_id, generation, kind, content, tool_calls,
                            context_size, usage, timestamp
                     FROM conversation_messages WHERE session_id = ?1
                     ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![session_id, n as i64], row_to_message)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, session_id, generation, kind, content, tool_calls,
                            context_size, usage, timestamp
                     FROM conversation_messages WHERE session_id = ?1
                     ORDER BY id ASC",
                )?;
                let rows = stmt.query_map(params![session_id], row_to_message)?;
                return Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?);
            }
        };
        messages.reverse();
        Ok(messages)
    }

    /// Messages produced at a specific generation, oldest first.
    pub fn get_generation_history(
        &self,
        session_id: &str,
        generation: &str,
    ) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, generation, kind, content, tool_calls,
                    context_size, usage, timestamp
             FROM conversation_messages WHERE session_id = ?1 AND generation = ?2
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![session_id, generation], row_to_message)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Substring search over message content.  Identical-content hits come
    /// back in insertion order, which keeps the result stable.
    pub fn search_conversations(
        &self,
        session_id: &str,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>> {
        let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, generation, kind, content, tool_calls,
                    context_size, usage, timestamp
             FROM conversation_messages
             WHERE session_id = ?1 AND content LIKE ?2 ESCAPE '\\'
             ORDER BY id ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![session_id, pattern, limit.unwrap_or(100) as i64],
            row_to_message,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Record that an agent compressed its context and handed off.
    pub fn save_handoff(
        &self,
        session_id: &str,
        generation: &str,
        compressed_context: &str,
        reason: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        conn.execute(
            "INSERT INTO handoffs (session_id, generation, compressed_context, reason, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, generation, compressed_context, reason, ts],
        )?;
        Ok(())
    }

    /// The most recent handoff for a session, if any.  The successor agent
    /// seeds its prompt from this instead of the raw history.
    pub fn latest_handoff(&self, session_id: &str) -> Result<Option<HandoffRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, generation, compressed_context, reason, timestamp
             FROM handoffs WHERE session_id = ?1 ORDER BY id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![session_id], |row| {
            let ts: String = row.get(5)?;
            Ok(HandoffRecord {
                id: row.get(0)?,
                session_id: row.get(1)?,
                generation: row.get(2)?,
                compressed_context: row.get(3)?,
                reason: row.get(4)?,
                timestamp: ts.parse().unwrap_or_else(|_| Utc::now()),
            })
        })?;
        Ok(rows.next().transpose()?)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let kind: String = row.get(3)?;
    let tool_calls: Option<String> = row.get(5)?;
    let usage: Option<String> = row.get(7)?;
    let ts: String = row.get(8)?;
    let context_size: Option<i64> = row.get(6)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        generation: row.get(2)?,
        role: MessageKind::parse(&kind).unwrap_or(MessageKind::AgentActivity),
        content: row.get(4)?,
        timestamp: ts.parse().unwrap_or_else(|_| Utc::now()),
        context_size: context_size.map(|c| c as usize),
        tool_calls: tool_calls.and_then(|t| serde_json::from_str(&t).ok()),
        usage: usage.and_then(|u| serde_json::from_str(&u).ok()),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
