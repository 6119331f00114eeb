// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Configuration types for the orchestration engine.
//!
//! All structs are plain serde data with field-level defaults so a partial
//! config deserializes into a fully usable value.  Loading from files and
//! CLI flags happens outside the engine; callers hand a finished
//! [`EngineConfig`] to the orchestrator.

use serde::{Deserialize, Serialize};

/// Serde default helper: returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so enabled-by-default fields need a named function.
fn default_true() -> bool {
    true
}

fn default_max_iterations() -> u32 {
    25
}

fn default_history_limit() -> usize {
    50
}

fn default_tool_result_char_cap() -> usize {
    30_000
}

fn default_delegation_timeout_ms() -> u64 {
    300_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_calls() -> u32 {
    1
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub snapshots: SnapshotConfig,
}

/// Limits and knobs for a single agent's model ↔ tool loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum model-call rounds per user turn.  Exceeding it is a
    /// controlled stop that surfaces the partial transcript.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// How many of the most recent stored messages are loaded into the
    /// prompt at the start of a turn.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Tool results longer than this are head+tail truncated before being
    /// fed back to the model.
    #[serde(default = "default_tool_result_char_cap")]
    pub tool_result_char_cap: usize,
    /// Override for the role's default parallel-tool bound.
    #[serde(default)]
    pub max_concurrent_tools: Option<usize>,
    /// Override for the role's context handoff threshold (fraction of the
    /// model's context window, 0.0–1.0).
    #[serde(default)]
    pub handoff_threshold: Option<f32>,
    /// Default budget for one delegated subagent run.
    #[serde(default = "default_delegation_timeout_ms")]
    pub delegation_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            history_limit: default_history_limit(),
            tool_result_char_cap: default_tool_result_char_cap(),
            max_concurrent_tools: None,
            handoff_threshold: None,
            delegation_timeout_ms: default_delegation_timeout_ms(),
        }
    }
}

/// Exponential backoff parameters shared by model and tool retries.
///
/// The delay for attempt `n` is
/// `min(max_delay, base_delay * multiplier^n)` plus 10% additive jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retry budget per call (model call or tool call).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Per-tool-name circuit breaker parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an open breaker blocks calls before probing (half-open).
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    /// Concurrent probe calls admitted while half-open.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

/// Snapshot hook bracketing for tool calls.
///
/// Snapshot capture itself lives outside the engine; these flags only
/// control when the hook seam is exercised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Capture project state before the tool runs.
    #[serde(default = "default_true")]
    pub enable_pre_tool_snapshots: bool,
    /// Capture state after the tool runs, including its result.
    #[serde(default = "default_true")]
    pub enable_post_tool_snapshots: bool,
    /// Take the post snapshot even when the tool threw.
    #[serde(default = "default_true")]
    pub snapshot_on_errors: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enable_pre_tool_snapshots: true,
            enable_post_tool_snapshots: true,
            snapshot_on_errors: true,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
