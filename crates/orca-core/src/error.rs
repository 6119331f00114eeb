// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Failures that terminate an agent turn.
///
/// Tool failures, denied approvals, and open circuits are NOT here; they
/// are fed back to the model as tool-result content so it can adapt.
/// Cancellation and the iteration limit are controlled returns carried in
/// [`crate::AgentReply::stop_reason`], not errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The model call failed after exhausting its retry budget, or with a
    /// non-retriable provider error.
    #[error("model call failed: {0}")]
    ModelCallFailed(#[source] anyhow::Error),

    /// The prompt would exceed the model's context window even after a
    /// handoff attempt.
    #[error("context overflow: estimated {estimated} tokens exceeds the usable window of {max}")]
    ContextOverflow { estimated: usize, max: usize },

    /// A second turn was started on a session before the first returned.
    #[error("a turn is already in progress for this session")]
    ConcurrentTurnRejected,

    /// The conversation store rejected a durable write.
    #[error("conversation store write failed: {0}")]
    Persistence(#[source] anyhow::Error),

    /// Subagent construction failed (unknown role, unresolvable model).
    #[error("failed to spawn subagent: {0}")]
    SpawnFailed(String),
}

impl EngineError {
    pub(crate) fn persistence(e: anyhow::Error) -> Self {
        Self::Persistence(e)
    }
}
