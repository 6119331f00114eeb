// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;

use crate::{
    ChatRequest, EventStream, ModelDefinition, ModelSession, Role, StreamEvent, Usage,
};

/// Deterministic mock session for tests.  Echoes the last user message back
/// as the assistant response.
pub struct MockSession {
    definition: ModelDefinition,
}

impl Default for MockSession {
    fn default() -> Self {
        Self { definition: ModelDefinition::mock() }
    }
}

#[async_trait]
impl ModelSession for MockSession {
    fn definition(&self) -> &ModelDefinition {
        &self.definition
    }

    async fn chat(&self, req: ChatRequest) -> anyhow::Result<EventStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();

        let events: Vec<anyhow::Result<StreamEvent>> = vec![
            Ok(StreamEvent::Token(format!("MOCK: {reply}"))),
            Ok(StreamEvent::Usage(Usage {
                input_tokens: 10,
                output_tokens: 10,
                ..Default::default()
            })),
            Ok(StreamEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// One scripted reply: either a sequence of stream events or a chat-level
/// failure (the `chat` call itself errors, exercising retry paths).
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Respond(Vec<StreamEvent>),
    Fail(String),
}

/// A pre-scripted mock session.  Each `chat` call pops the next step from the
/// front of the queue, so tests can specify exact event sequences,
/// including tool calls and provider failures, without network access.
pub struct ScriptedMockSession {
    steps: Mutex<Vec<ScriptStep>>,
    definition: ModelDefinition,
    /// The last `ChatRequest` seen, for request-shape assertions.
    pub last_request: Mutex<Option<ChatRequest>>,
    /// Number of `chat` calls made so far.
    pub calls: AtomicUsize,
}

impl ScriptedMockSession {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps),
            definition: ModelDefinition::mock(),
            last_request: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Replace the model definition (context window, prices) reported to
    /// callers.  Used to exercise handoff and cost paths.
    pub fn with_definition(mut self, definition: ModelDefinition) -> Self {
        self.definition = definition;
        self
    }

    /// Events for a plain text reply with nominal usage.
    pub fn text_events(text: impl Into<String>) -> Vec<StreamEvent> {
        vec![
            StreamEvent::Token(text.into()),
            StreamEvent::Usage(Usage { input_tokens: 5, output_tokens: 5, ..Default::default() }),
            StreamEvent::Done,
        ]
    }

    /// Events for a turn that requests the given tool calls.
    pub fn tool_call_events(calls: &[(&str, &str, &str)]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for (index, (id, name, args)) in calls.iter().enumerate() {
            let index = index as u32;
            events.push(StreamEvent::ToolUseStart {
                index,
                id: id.to_string(),
                name: name.to_string(),
            });
            events.push(StreamEvent::ToolInputDelta { index, delta: args.to_string() });
            events.push(StreamEvent::ToolUseComplete { index });
        }
        events.push(StreamEvent::Usage(Usage {
            input_tokens: 5,
            output_tokens: 5,
            ..Default::default()
        }));
        events.push(StreamEvent::Done);
        events
    }

    /// Convenience: session that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![ScriptStep::Respond(Self::text_events(reply))])
    }

    /// Convenience: one round of tool calls, then a text reply.
    pub fn tools_then_text(calls: &[(&str, &str, &str)], final_text: impl Into<String>) -> Self {
        Self::new(vec![
            ScriptStep::Respond(Self::tool_call_events(calls)),
            ScriptStep::Respond(Self::text_events(final_text)),
        ])
    }

    /// Convenience: fail `n` chat calls with `message`, then reply with text.
    pub fn fail_times_then_text(n: usize, message: &str, final_text: impl Into<String>) -> Self {
        let mut steps: Vec<ScriptStep> =
            (0..n).map(|_| ScriptStep::Fail(message.to_string())).collect();
        steps.push(ScriptStep::Respond(Self::text_events(final_text)));
        Self::new(steps)
    }
}

#[async_trait]
impl ModelSession for ScriptedMockSession {
    fn definition(&self) -> &ModelDefinition {
        &self.definition
    }

    async fn chat(&self, req: ChatRequest) -> anyhow::Result<EventStream> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        *self.last_request.lock().unwrap() = Some(req);
        let step = {
            let mut steps = self.steps.lock().unwrap();
            if steps.is_empty() {
                // Fallback when all steps are consumed
                ScriptStep::Respond(vec![
                    StreamEvent::Token("[no more scripts]".into()),
                    StreamEvent::Done,
                ])
            } else {
                steps.remove(0)
            }
        };
        match step {
            ScriptStep::Fail(msg) => anyhow::bail!(msg),
            ScriptStep::Respond(events) => {
                let wrapped: Vec<anyhow::Result<StreamEvent>> =
                    events.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(wrapped)))
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
