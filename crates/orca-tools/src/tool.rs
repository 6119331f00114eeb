// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Declared type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamKind {
    /// JSON Schema `type` keyword for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    /// Whether a JSON value matches this kind.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

/// Declaration of one parameter of a tool method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub kind: ParamKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub required: bool,
}

impl ParamSpec {
    pub fn required(kind: ParamKind) -> Self {
        Self { kind, description: None, required: true }
    }

    pub fn optional(kind: ParamKind) -> Self {
        Self { kind, description: None, required: false }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Declaration of one method of a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodSpec {
    pub description: String,
    #[serde(default)]
    pub params: BTreeMap<String, ParamSpec>,
}

impl MethodSpec {
    pub fn new(description: impl Into<String>) -> Self {
        Self { description: description.into(), params: BTreeMap::new() }
    }

    pub fn param(mut self, name: impl Into<String>, spec: ParamSpec) -> Self {
        self.params.insert(name.into(), spec);
        self
    }

    /// JSON Schema object for this method's parameters, with the `required`
    /// list collected from `required: true` entries.
    pub fn input_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for (name, p) in &self.params {
            let mut prop = serde_json::Map::new();
            prop.insert("type".into(), json!(p.kind.as_str()));
            if let Some(desc) = &p.description {
                prop.insert("description".into(), json!(desc));
            }
            properties.insert(name.clone(), Value::Object(prop));
            if p.required {
                required.push(json!(name));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Declaration of a tool: description plus its method map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub description: String,
    pub methods: BTreeMap<String, MethodSpec>,
}

impl ToolSpec {
    pub fn new(description: impl Into<String>) -> Self {
        Self { description: description.into(), methods: BTreeMap::new() }
    }

    pub fn method(mut self, name: impl Into<String>, spec: MethodSpec) -> Self {
        self.methods.insert(name.into(), spec);
        self
    }
}

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Opaque identifier assigned by the model (forwarded verbatim).
    pub id: String,
    /// Canonical `<tool>_<method>` name.
    pub name: String,
    /// Parsed JSON arguments.
    pub input: Value,
}

/// The engine's answer to one [`ToolCall`], always paired 1:1 with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(rename = "callId")]
    pub call_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub denied: bool,
    #[serde(default)]
    pub recovered: bool,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn ok(call_id: impl Into<String>, data: Value, duration_ms: u64) -> Self {
        Self {
            call_id: call_id.into(),
            success: true,
            data: Some(data),
            error: None,
            denied: false,
            recovered: false,
            duration_ms,
        }
    }

    pub fn err(call_id: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            call_id: call_id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
            denied: false,
            recovered: false,
            duration_ms,
        }
    }

    /// Synthetic result for a call the approval policy refused.
    pub fn denied(call_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: false,
            data: None,
            error: Some(reason.into()),
            denied: true,
            recovered: false,
            duration_ms: 0,
        }
    }

    /// Synthetic result for a call blocked by an open circuit breaker.
    pub fn circuit_open(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: false,
            data: None,
            error: Some("circuit_open".into()),
            denied: false,
            recovered: false,
            duration_ms: 0,
        }
    }

    /// Synthetic result for a call abandoned by cancellation.
    pub fn cancelled(call_id: impl Into<String>) -> Self {
        Self::err(call_id, "cancelled", 0)
    }

    /// The JSON shape fed back to the model as tool-result content.
    pub fn to_model_json(&self) -> Value {
        if self.denied {
            return json!({
                "denied": true,
                "reason": self.error.clone().unwrap_or_default(),
            });
        }
        if self.success {
            json!({ "success": true, "data": self.data.clone().unwrap_or(Value::Null) })
        } else if self.error.as_deref() == Some("circuit_open") {
            json!({ "success": false, "error": "circuit_open", "recovered": self.recovered })
        } else {
            json!({ "success": false, "error": self.error.clone().unwrap_or_default() })
        }
    }
}

/// Failures raised at the registry boundary or inside a tool.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid parameters: {0}")]
    Validation(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool '{tool}' has no method '{method}'")]
    UnknownMethod { tool: String, method: String },
    #[error(transparent)]
    Execution(#[from] anyhow::Error),
}

/// Capability set every tool implements.
///
/// A tool is a named bundle of methods; the registry validates parameters
/// against [`ToolSpec`] before `invoke` ever runs, so implementations may
/// assume declared required parameters are present and well-typed.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn spec(&self) -> ToolSpec;
    /// Execute one method.  Failures are ordinary `Err` values; they are
    /// surfaced to the model as tool-result errors, never fatal to the loop.
    async fn invoke(&self, method: &str, params: &Value) -> anyhow::Result<Value>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
