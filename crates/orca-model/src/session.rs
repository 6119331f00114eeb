// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{ChatRequest, Message, ModelDefinition, StreamEvent, ToolSchema};

pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// Pre-flight sizing result from [`ModelSession::count_tokens`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCount {
    pub input_tokens: usize,
    pub total_tokens: usize,
}

/// A stateful dialog with a single model.
///
/// This is the only surface the engine sees of a model provider; HTTP
/// clients, SSE parsing, and vendor framing live behind it.  Cancellation is
/// cooperative: the caller stops consuming (drops) the stream when its
/// cancellation signal fires.
#[async_trait]
pub trait ModelSession: Send + Sync {
    /// Read-only metadata: context window, pricing, capabilities.
    fn definition(&self) -> &ModelDefinition;

    /// Send a chat request and return a streaming response.
    async fn chat(&self, req: ChatRequest) -> anyhow::Result<EventStream>;

    /// Best-effort pre-flight sizing of a request.
    ///
    /// The default implementation uses the chars/4 heuristic plus a rough
    /// estimate of the serialized tool schemas.  Sessions backed by a
    /// provider token-counting endpoint should override this; callers treat
    /// the result as advisory either way.
    async fn count_tokens(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> anyhow::Result<TokenCount> {
        let message_tokens: usize = messages.iter().map(|m| m.approx_tokens()).sum();
        let schema_tokens: usize = tools
            .iter()
            .map(|t| (t.name.len() + t.description.len() + t.input_schema.to_string().len()) / 4)
            .sum();
        let total = message_tokens + schema_tokens;
        Ok(TokenCount { input_tokens: total, total_tokens: total })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
