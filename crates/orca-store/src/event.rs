// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of event types the engine emits.
///
/// The string identifiers are part of the persisted format and are read by
/// external aggregators; they must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    UserInput,
    AgentResponse,
    ModelRequest,
    ModelResponse,
    ToolExecutionStart,
    ToolExecutionComplete,
    SnapshotError,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserInput => "user_input",
            Self::AgentResponse => "agent_response",
            Self::ModelRequest => "model_request",
            Self::ModelResponse => "model_response",
            Self::ToolExecutionStart => "tool_execution_start",
            Self::ToolExecutionComplete => "tool_execution_complete",
            Self::SnapshotError => "snapshot_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user_input" => Some(Self::UserInput),
            "agent_response" => Some(Self::AgentResponse),
            "model_request" => Some(Self::ModelRequest),
            "model_response" => Some(Self::ModelResponse),
            "tool_execution_start" => Some(Self::ToolExecutionStart),
            "tool_execution_complete" => Some(Self::ToolExecutionComplete),
            "snapshot_error" => Some(Self::SnapshotError),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a tool call a snapshot hook failed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPhase {
    #[serde(rename = "pre-tool")]
    PreTool,
    #[serde(rename = "post-tool")]
    PostTool,
}

/// Typed event payloads.
///
/// The engine constructs these in code; the documented JSON field names are
/// produced only at the persistence boundary via [`EventPayload::to_json`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    UserInput {
        content: String,
        #[serde(rename = "inputMode", skip_serializing_if = "Option::is_none")]
        input_mode: Option<String>,
        timestamp: DateTime<Utc>,
    },
    AgentResponse {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tokens: Option<u64>,
        #[serde(rename = "inputTokens", skip_serializing_if = "Option::is_none")]
        input_tokens: Option<u64>,
        #[serde(rename = "outputTokens", skip_serializing_if = "Option::is_none")]
        output_tokens: Option<u64>,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        timestamp: DateTime<Utc>,
    },
    ModelRequest {
        provider: String,
        model: String,
        /// Serialized message array sent to the model.
        prompt: Value,
        timestamp: DateTime<Utc>,
    },
    ModelResponse {
        content: String,
        tokens_in: u64,
        tokens_out: u64,
        cost: f64,
        duration_ms: u64,
    },
    ToolExecutionStart {
        tool: String,
        method: String,
        params: Value,
    },
    ToolExecutionComplete {
        success: bool,
        result: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        duration_ms: u64,
    },
    SnapshotError {
        error: String,
        #[serde(rename = "type")]
        phase: SnapshotPhase,
    },
}

impl EventPayload {
    /// The event type this payload belongs to.
    pub fn kind(&self) -> EventType {
        match self {
            Self::UserInput { .. } => EventType::UserInput,
            Self::AgentResponse { .. } => EventType::AgentResponse,
            Self::ModelRequest { .. } => EventType::ModelRequest,
            Self::ModelResponse { .. } => EventType::ModelResponse,
            Self::ToolExecutionStart { .. } => EventType::ToolExecutionStart,
            Self::ToolExecutionComplete { .. } => EventType::ToolExecutionComplete,
            Self::SnapshotError { .. } => EventType::SnapshotError,
        }
    }

    /// Serialize to the documented wire shape (plain field object, no tag).
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// One persisted activity event.  `data` is the payload in its documented
/// JSON shape; readers filter and aggregate without a typed decode.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEvent {
    pub id: i64,
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "modelSessionId", skip_serializing_if = "Option::is_none")]
    pub model_session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
