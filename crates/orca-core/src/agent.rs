// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_recursion::async_recursion;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use orca_config::EngineConfig;
use orca_model::{
    ChatRequest, Message, ModelSession, StreamEvent, ToolSchema, Usage,
};
use orca_store::{
    ActivityLog, ConversationStore, EventPayload, MessageKind, NewMessage, UsageRecord,
};
use orca_tools::{ApprovalEngine, ApprovalRequest, ToolCall, ToolRegistry, ToolResult};

use crate::breaker::BreakerMap;
use crate::error::EngineError;
use crate::executor::ToolExecutor;
use crate::generation::Generation;
use crate::handoff::{compress_history, truncate_head_tail};
use crate::metrics::ConversationMetrics;
use crate::prompts::system_prompt;
use crate::retry::RetryPolicy;
use crate::roles::{choose_role_for_task, lookup_role, RoleDefinition};

/// Canonical name of the delegation tool.  Calls to it are intercepted by
/// the agent loop and spawn a subagent; the tool never lives in the registry.
pub const DELEGATE_TOOL_NAME: &str = "agent_delegate";

const MAX_EMPTY_TURN_RETRIES: u32 = 2;
const HANDOFF_SUMMARY_CHAR_CAP: usize = 8_000;

/// Resolves a `(provider, model)` pair to a live session.
///
/// Session construction (HTTP clients, credentials) is outside the engine;
/// orchestrators inject a resolver at startup and subagents inherit it.
pub trait ModelResolver: Send + Sync {
    fn resolve(&self, provider: &str, model: &str) -> anyhow::Result<Arc<dyn ModelSession>>;
}

/// Resolver that answers every request with the same session.  Sufficient
/// for single-model deployments and for tests.
pub struct SingleModelResolver(pub Arc<dyn ModelSession>);

impl ModelResolver for SingleModelResolver {
    fn resolve(&self, _provider: &str, _model: &str) -> anyhow::Result<Arc<dyn ModelSession>> {
        Ok(Arc::clone(&self.0))
    }
}

/// Shared capabilities an agent holds.  Subagents inherit a clone at spawn;
/// everything inside is behind an `Arc`, so cloning is cheap and children
/// never hold a back-reference to their parent.
#[derive(Clone)]
pub struct AgentContext {
    pub activity: Arc<ActivityLog>,
    pub conversation: Arc<ConversationStore>,
    pub registry: Arc<ToolRegistry>,
    pub approval: Arc<dyn ApprovalEngine>,
    pub models: Arc<dyn ModelResolver>,
    pub config: Arc<EngineConfig>,
}

/// Arguments for [`Agent::spawn_subagent`].
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub role: Option<String>,
    /// `(provider, model)` override; the role default applies otherwise.
    pub model: Option<(String, String)>,
    pub task: Option<String>,
    pub capabilities: Option<Vec<String>>,
}

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model produced a reply with no tool calls.
    EndTurn,
    /// The loop hit its iteration bound; the reply carries the partial
    /// transcript.
    IterationLimit,
    /// The turn was cancelled externally.
    Cancelled,
}

/// The final answer of one user turn.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub content: String,
    /// All tool calls made across the turn's rounds, in request order.
    pub tool_calls: Vec<ToolCall>,
    /// Their results, positionally aligned with `tool_calls`.
    pub tool_results: Vec<ToolResult>,
    pub usage: Usage,
    pub duration_ms: u64,
    pub cancelled: bool,
    pub stop_reason: StopReason,
}

impl AgentReply {
    fn cancelled_reply(
        tool_calls: Vec<ToolCall>,
        tool_results: Vec<ToolResult>,
        usage: Usage,
        started: Instant,
    ) -> Self {
        Self {
            content: "<cancelled>".into(),
            tool_calls,
            tool_results,
            usage,
            duration_ms: started.elapsed().as_millis() as u64,
            cancelled: true,
            stop_reason: StopReason::Cancelled,
        }
    }
}

/// One parsed model turn.
struct ModelTurn {
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: Usage,
}

/// Accumulator for one streamed tool call, keyed by the provider's
/// parallel-tool-call index.
#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    fn finish(self, index: u32) -> Option<ToolCall> {
        if self.name.is_empty() {
            warn!(tool_call_id = %self.id, "dropping tool call with empty name from model");
            return None;
        }
        let id = if self.id.is_empty() {
            warn!(tool_name = %self.name, "tool call had empty id; generating synthetic id");
            format!("tc_synthetic_{index}")
        } else {
            self.id
        };
        let input = if self.args_buf.is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        tool_name = %self.name,
                        error = %e,
                        "tool call had invalid JSON arguments; substituting {{}}"
                    );
                    Value::Object(Default::default())
                }
            }
        };
        Some(ToolCall { id, name: self.name, input })
    }
}

/// A prepared subagent delegation, ready to run alongside the tool batch.
struct Delegation {
    call_id: String,
    agent: Agent,
    instructions: String,
    timeout_ms: u64,
}

/// One model-driven execution unit.
///
/// Owns its context budget, its circuit-breaker map, and its conversation
/// metrics; shares the stores, registry, and approval engine through
/// [`AgentContext`].  Drives the model ↔ tool loop and spawns subagents for
/// delegation tool calls.
pub struct Agent {
    session_id: String,
    generation: Generation,
    role: &'static RoleDefinition,
    model: Arc<dyn ModelSession>,
    capabilities: Vec<String>,
    task: Option<String>,
    ctx: AgentContext,
    breakers: Arc<BreakerMap>,
    executor: ToolExecutor,
    retry: RetryPolicy,
    subagent_counter: u32,
    metrics: ConversationMetrics,
    max_context_size: usize,
    handoff_threshold: f32,
    /// Set on handoff successors so a second overflow fails instead of
    /// spawning an endless chain.
    handoff_attempted: bool,
    /// Compressed predecessor context; replaces history in the first prompt.
    seed_summary: Option<String>,
    /// In-memory model transcript for the current conversation.
    transcript: Vec<Message>,
}

impl Agent {
    pub fn new(
        session_id: impl Into<String>,
        generation: Generation,
        role: &'static RoleDefinition,
        model: Arc<dyn ModelSession>,
        ctx: AgentContext,
    ) -> Self {
        let max_context_size =
            (model.definition().context_window as usize).min(role.max_context_size);
        let handoff_threshold =
            ctx.config.agent.handoff_threshold.unwrap_or(role.handoff_threshold);
        let max_concurrent =
            ctx.config.agent.max_concurrent_tools.unwrap_or(role.max_concurrent_tools);
        let breakers = Arc::new(BreakerMap::new(ctx.config.breaker.clone()));
        let executor = ToolExecutor::new(
            Arc::clone(&ctx.registry),
            Arc::clone(&ctx.approval),
            Arc::clone(&breakers),
            ctx.config.retry.clone(),
            max_concurrent,
        );
        let retry = RetryPolicy::new(ctx.config.retry.clone());
        Self {
            session_id: session_id.into(),
            generation,
            role,
            model,
            capabilities: role.capabilities.iter().map(|c| c.to_string()).collect(),
            task: None,
            ctx,
            breakers,
            executor,
            retry,
            subagent_counter: 0,
            metrics: ConversationMetrics::default(),
            max_context_size,
            handoff_threshold,
            handoff_attempted: false,
            seed_summary: None,
            transcript: Vec::new(),
        }
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    pub fn role(&self) -> &'static RoleDefinition {
        self.role
    }

    pub fn metrics(&self) -> &ConversationMetrics {
        &self.metrics
    }

    pub fn breakers(&self) -> &Arc<BreakerMap> {
        &self.breakers
    }

    pub fn subagent_count(&self) -> u32 {
        self.subagent_counter
    }

    /// Pick a role for a task description.  See [`choose_role_for_task`].
    pub fn choose_agent_for_task(task: &str) -> &'static RoleDefinition {
        choose_role_for_task(task)
    }

    /// Run one user turn: persist the input, drive the model ↔ tool loop to
    /// a final reply, and record everything in both stores.
    pub async fn process_input(
        &mut self,
        user_message: &str,
        cancel: &CancellationToken,
    ) -> Result<AgentReply, EngineError> {
        // Seed before persisting so a resumed session does not replay the
        // message we are about to save.
        self.seed_transcript()?;

        self.save_text_message(MessageKind::User, user_message, None, None)?;
        self.ctx.activity.log_event(
            &self.session_id,
            None,
            &EventPayload::UserInput {
                content: user_message.to_string(),
                input_mode: None,
                timestamp: Utc::now(),
            },
        );

        self.run_turn(user_message, cancel).await
    }

    /// The model ↔ tool loop.  Also the re-entry point for handoff
    /// successors, which must not re-persist the user message.
    #[async_recursion]
    async fn run_turn(
        &mut self,
        user_message: &str,
        cancel: &CancellationToken,
    ) -> Result<AgentReply, EngineError> {
        let turn_started = Instant::now();
        self.seed_transcript()?;
        self.transcript.push(Message::user(user_message));
        self.metrics.record_message();

        let mut all_tool_calls: Vec<ToolCall> = Vec::new();
        let mut all_tool_results: Vec<ToolResult> = Vec::new();
        let mut usage_total = Usage::default();
        let mut partial_text = String::new();
        let mut empty_turn_retries = 0u32;
        let mut rounds = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Ok(AgentReply::cancelled_reply(
                    all_tool_calls,
                    all_tool_results,
                    usage_total,
                    turn_started,
                ));
            }

            rounds += 1;
            if rounds > self.ctx.config.agent.max_iterations {
                let content = format!(
                    "iteration_limit_reached: stopped after {} model rounds without a final \
                     answer.\n\nPartial progress:\n{partial_text}",
                    self.ctx.config.agent.max_iterations
                );
                self.save_text_message(MessageKind::Assistant, &content, None, None)?;
                self.emit_agent_response(&content, &usage_total, turn_started);
                return Ok(AgentReply {
                    content,
                    tool_calls: all_tool_calls,
                    tool_results: all_tool_results,
                    usage: usage_total,
                    duration_ms: turn_started.elapsed().as_millis() as u64,
                    cancelled: false,
                    stop_reason: StopReason::IterationLimit,
                });
            }

            let mut tools = self.executor.model_schemas();
            tools.push(delegation_schema());

            // Pre-call context gate.  The estimate is advisory when the
            // session cannot count tokens; the handoff threshold is still
            // enforced against the fallback heuristic.
            let estimated = self.estimate_context(&tools).await;
            let budget = (self.max_context_size as f32 * self.handoff_threshold) as usize;
            if estimated > budget {
                if self.handoff_attempted {
                    return Err(EngineError::ContextOverflow {
                        estimated,
                        max: self.max_context_size,
                    });
                }
                return self.hand_off(user_message, cancel).await;
            }

            let turn = match self.chat_once(&tools, estimated, cancel).await? {
                Some(turn) => turn,
                None => {
                    return Ok(AgentReply::cancelled_reply(
                        all_tool_calls,
                        all_tool_results,
                        usage_total,
                        turn_started,
                    ))
                }
            };
            usage_total.add(&turn.usage);
            self.metrics.record_usage(&turn.usage);

            if turn.tool_calls.is_empty() {
                if turn.text.is_empty() && empty_turn_retries < MAX_EMPTY_TURN_RETRIES {
                    empty_turn_retries += 1;
                    self.transcript.push(Message::user(
                        "You produced neither a response nor a tool call. \
                         Continue with your next action.",
                    ));
                    continue;
                }
                self.transcript.push(Message::assistant(&turn.text));
                self.metrics.record_message();
                self.save_text_message(
                    MessageKind::Assistant,
                    &turn.text,
                    Some(&turn.usage),
                    Some(estimated),
                )?;
                self.emit_agent_response(&turn.text, &usage_total, turn_started);
                return Ok(AgentReply {
                    content: turn.text,
                    tool_calls: all_tool_calls,
                    tool_results: all_tool_results,
                    usage: usage_total,
                    duration_ms: turn_started.elapsed().as_millis() as u64,
                    cancelled: false,
                    stop_reason: StopReason::EndTurn,
                });
            }

            empty_turn_retries = 0;
            if !turn.text.is_empty() {
                partial_text.push_str(&turn.text);
                partial_text.push('\n');
            }

            // Persist the assistant message with its attached tool calls,
            // then mirror it into the transcript.
            let tool_calls_json =
                serde_json::to_value(&turn.tool_calls).unwrap_or(Value::Null);
            self.ctx
                .conversation
                .save_message(&NewMessage {
                    session_id: self.session_id.clone(),
                    generation: self.generation.to_string(),
                    kind: MessageKind::Assistant,
                    content: turn.text.clone(),
                    tool_calls: Some(tool_calls_json),
                    context_size: Some(estimated),
                    usage: Some(usage_record(&turn.usage)),
                })
                .map_err(EngineError::persistence)?;
            self.metrics.record_message();

            if !turn.text.is_empty() {
                self.transcript.push(Message::assistant(&turn.text));
            }
            for tc in &turn.tool_calls {
                self.transcript.push(Message::tool_call(&tc.id, &tc.name, tc.input.to_string()));
            }

            let results = self.dispatch_round(&turn.tool_calls, cancel).await?;

            let cap = self.ctx.config.agent.tool_result_char_cap;
            for (tc, result) in turn.tool_calls.iter().zip(results.iter()) {
                let content = truncate_head_tail(&result.to_model_json().to_string(), cap);
                self.ctx
                    .conversation
                    .save_message(&NewMessage::text(
                        &self.session_id,
                        &self.generation.to_string(),
                        MessageKind::ToolResult,
                        &content,
                    ))
                    .map_err(EngineError::persistence)?;
                self.metrics.record_message();
                self.transcript.push(Message::tool_result(&tc.id, &content));
            }

            all_tool_calls.extend(turn.tool_calls);
            all_tool_results.extend(results);
        }
    }

    /// Spawn a child agent inheriting this agent's session and capabilities.
    ///
    /// The child starts with fresh metrics and a fresh breaker map, and its
    /// generation extends this agent's lineage path.
    pub fn spawn_subagent(&mut self, opts: SpawnOptions) -> Result<Agent, EngineError> {
        let role = match &opts.role {
            Some(name) => lookup_role(name)
                .ok_or_else(|| EngineError::SpawnFailed(format!("unknown role '{name}'")))?,
            None => self.role,
        };
        self.subagent_counter += 1;
        let generation = self.generation.child(self.subagent_counter);

        let model = match &opts.model {
            Some((provider, name)) => self
                .ctx
                .models
                .resolve(provider, name)
                .map_err(|e| EngineError::SpawnFailed(e.to_string()))?,
            None if role.name == self.role.name => Arc::clone(&self.model),
            None => self
                .ctx
                .models
                .resolve(role.default_provider, role.default_model)
                .map_err(|e| EngineError::SpawnFailed(e.to_string()))?,
        };

        debug!(
            parent = %self.generation,
            child = %generation,
            role = role.name,
            "spawning subagent"
        );
        let mut agent =
            Agent::new(self.session_id.clone(), generation, role, model, self.ctx.clone());
        agent.task = opts.task;
        if let Some(capabilities) = opts.capabilities {
            agent.capabilities = capabilities;
        }
        Ok(agent)
    }

    // ─── Loop internals ───────────────────────────────────────────────────────

    /// Inject the system prompt and prior context on first use.
    fn seed_transcript(&mut self) -> Result<(), EngineError> {
        if !self.transcript.is_empty() {
            return Ok(());
        }
        let system = system_prompt(
            self.role,
            self.task.as_deref(),
            &self.capabilities,
            &self.model.definition().name,
            &self.executor.tool_summary(),
        );
        self.transcript.push(Message::system(system));

        // A handoff summary replaces prior history entirely.
        if let Some(summary) = self.seed_summary.take() {
            self.transcript.push(Message::assistant(summary));
            return Ok(());
        }

        // Delegated subagents carry their task in the system prompt and
        // start with a clean context; only session root agents resume from
        // the stored transcript.
        if self.task.is_some() {
            return Ok(());
        }

        let history = self
            .ctx
            .conversation
            .get_conversation_history(&self.session_id, Some(self.ctx.config.agent.history_limit))
            .map_err(EngineError::persistence)?;
        for m in history {
            // Only plain dialogue is replayed; stored tool rounds reference
            // call ids the model no longer knows about.
            match m.role {
                MessageKind::User => self.transcript.push(Message::user(m.content)),
                MessageKind::Assistant if m.tool_calls.is_none() => {
                    self.transcript.push(Message::assistant(m.content))
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Compress the session, record the handoff, and continue the turn in a
    /// fresh successor agent seeded from the summary.
    async fn hand_off(
        &mut self,
        user_message: &str,
        cancel: &CancellationToken,
    ) -> Result<AgentReply, EngineError> {
        warn!(generation = %self.generation, "context threshold exceeded; handing off");
        let history = self
            .ctx
            .conversation
            .get_conversation_history(&self.session_id, Some(self.ctx.config.agent.history_limit))
            .map_err(EngineError::persistence)?;
        let summary = compress_history(&history, HANDOFF_SUMMARY_CHAR_CAP);
        self.ctx
            .conversation
            .save_handoff(
                &self.session_id,
                &self.generation.to_string(),
                &summary,
                "context threshold exceeded",
            )
            .map_err(EngineError::persistence)?;

        let mut successor = self.spawn_subagent(SpawnOptions {
            role: Some(self.role.name.to_string()),
            model: None,
            task: self.task.clone(),
            capabilities: Some(self.capabilities.clone()),
        })?;
        successor.handoff_attempted = true;
        successor.seed_summary = Some(summary);
        successor.run_turn(user_message, cancel).await
    }

    /// One model call: emit `model_request`, stream the reply (with retry on
    /// establishing it), accumulate text and tool calls, emit
    /// `model_response`.  Returns `None` when cancelled mid-stream.
    async fn chat_once(
        &mut self,
        tools: &[ToolSchema],
        context_size: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<ModelTurn>, EngineError> {
        let definition = self.model.definition().clone();
        let req = ChatRequest {
            messages: self.transcript.clone(),
            tools: tools.to_vec(),
            max_tokens: None,
            temperature: None,
            enable_caching: true,
        };

        self.ctx.activity.log_event(
            &self.session_id,
            None,
            &EventPayload::ModelRequest {
                provider: definition.provider.clone(),
                model: definition.name.clone(),
                prompt: serde_json::to_value(&req.messages).unwrap_or(Value::Null),
                timestamp: Utc::now(),
            },
        );
        debug!(
            generation = %self.generation,
            context_size,
            tools = tools.len(),
            "model request"
        );

        let started = Instant::now();
        let model = Arc::clone(&self.model);
        let stream = self
            .retry
            .run(cancel, || {
                let req = req.clone();
                let model = Arc::clone(&model);
                async move { model.chat(req).await }
            })
            .await;
        let mut stream = match stream {
            Ok(s) => s,
            Err(_) if cancel.is_cancelled() => return Ok(None),
            Err(e) => return Err(EngineError::ModelCallFailed(e)),
        };

        let mut text = String::new();
        let mut thinking_chars = 0usize;
        let mut usage = Usage::default();
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                event = stream.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                Ok(StreamEvent::Token(t)) => text.push_str(&t),
                Ok(StreamEvent::ThinkingToken(t)) => thinking_chars += t.len(),
                Ok(StreamEvent::ToolUseStart { index, id, name }) => {
                    let p = pending.entry(index).or_default();
                    if !id.is_empty() {
                        p.id = id;
                    }
                    if !name.is_empty() {
                        p.name = name;
                    }
                }
                Ok(StreamEvent::ToolInputDelta { index, delta }) => {
                    pending.entry(index).or_default().args_buf.push_str(&delta);
                }
                Ok(StreamEvent::ToolUseComplete { .. }) => {}
                Ok(StreamEvent::Usage(u)) => usage = u,
                Ok(StreamEvent::Done) => break,
                Ok(StreamEvent::Error(e)) => warn!("model stream warning: {e}"),
                Err(e) => return Err(EngineError::ModelCallFailed(e)),
            }
        }
        let duration_ms = started.elapsed().as_millis() as u64;
        if thinking_chars > 0 {
            debug!(thinking_chars, "model produced reasoning content");
        }

        let mut sorted: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
        sorted.sort_by_key(|(index, _)| *index);
        let tool_calls: Vec<ToolCall> =
            sorted.into_iter().filter_map(|(index, p)| p.finish(index)).collect();

        let cost = definition.cost(usage.input_tokens, usage.output_tokens);
        self.ctx.activity.log_event(
            &self.session_id,
            None,
            &EventPayload::ModelResponse {
                content: text.clone(),
                tokens_in: usage.input_tokens as u64,
                tokens_out: usage.output_tokens as u64,
                cost: cost.total_cost,
                duration_ms,
            },
        );

        Ok(Some(ModelTurn { text, tool_calls, usage }))
    }

    /// Execute one round's calls: delegation calls spawn subagents, the rest
    /// go through the executor; results merge back positionally.
    async fn dispatch_round(
        &mut self,
        calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Result<Vec<ToolResult>, EngineError> {
        let mut slots: Vec<Option<ToolResult>> = vec![None; calls.len()];
        let mut batch: Vec<(usize, ToolCall)> = Vec::new();
        let mut delegations: Vec<(usize, Delegation)> = Vec::new();

        for (i, tc) in calls.iter().enumerate() {
            if tc.name != DELEGATE_TOOL_NAME {
                batch.push((i, tc.clone()));
                continue;
            }
            // Delegation passes the same approval gate as any tool call.
            let decision = self
                .ctx
                .approval
                .request_approval(&ApprovalRequest::for_call(tc.clone()))
                .await;
            if !decision.approved {
                let reason =
                    decision.reason.unwrap_or_else(|| "approval denied".into());
                slots[i] = Some(ToolResult::denied(&tc.id, reason));
                continue;
            }
            match self.prepare_delegation(tc) {
                Ok(delegation) => delegations.push((i, delegation)),
                Err(message) => slots[i] = Some(ToolResult::err(&tc.id, message, 0)),
            }
        }

        let batch_calls: Vec<ToolCall> = batch.iter().map(|(_, c)| c.clone()).collect();
        let batch_fut =
            self.executor.execute_batch(&batch_calls, &self.session_id, &self.generation, cancel);
        let delegation_futs = delegations
            .into_iter()
            .map(|(i, d)| run_delegation(i, d, cancel.clone()));
        let (batch_results, delegation_results) =
            tokio::join!(batch_fut, futures::future::join_all(delegation_futs));

        for ((i, _), result) in batch.iter().zip(batch_results) {
            slots[*i] = Some(result);
        }
        for (i, result) in delegation_results {
            slots[i] = Some(result);
        }
        Ok(slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| {
                    ToolResult::err(&calls[i].id, "internal: no result produced", 0)
                })
            })
            .collect())
    }

    /// Parse a delegation call and construct its subagent.
    fn prepare_delegation(&mut self, tc: &ToolCall) -> Result<Delegation, String> {
        let instructions = tc
            .input
            .get("instructions")
            .and_then(Value::as_str)
            .ok_or("delegation requires an 'instructions' string")?
            .to_string();
        let purpose = tc.input.get("purpose").and_then(Value::as_str).map(str::to_string);
        let role = tc
            .input
            .get("role")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| choose_role_for_task(&instructions).name.to_string());
        let timeout_ms = tc
            .input
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(self.ctx.config.agent.delegation_timeout_ms);

        let agent = self
            .spawn_subagent(SpawnOptions {
                role: Some(role),
                model: None,
                task: purpose.or_else(|| Some(instructions.clone())),
                capabilities: None,
            })
            .map_err(|e| e.to_string())?;
        Ok(Delegation { call_id: tc.id.clone(), agent, instructions, timeout_ms })
    }

    /// Advisory pre-flight size of the next request.
    async fn estimate_context(&self, tools: &[ToolSchema]) -> usize {
        match self.model.count_tokens(&self.transcript, tools).await {
            Ok(count) => count.input_tokens,
            Err(e) => {
                debug!(error = %e, "token counting unavailable; using chars/4 estimate");
                let message_tokens: usize =
                    self.transcript.iter().map(|m| m.approx_tokens()).sum();
                let schema_tokens: usize = tools
                    .iter()
                    .map(|t| {
                        (t.name.len() + t.description.len() + t.input_schema.to_string().len())
                            / 4
                    })
                    .sum();
                message_tokens + schema_tokens
            }
        }
    }

    fn save_text_message(
        &self,
        kind: MessageKind,
        content: &str,
        usage: Option<&Usage>,
        context_size: Option<usize>,
    ) -> Result<(), EngineError> {
        let mut msg =
            NewMessage::text(&self.session_id, &self.generation.to_string(), kind, content);
        msg.usage = usage.map(usage_record);
        msg.context_size = context_size;
        self.ctx.conversation.save_message(&msg).map_err(EngineError::persistence)?;
        Ok(())
    }

    fn emit_agent_response(&self, content: &str, usage: &Usage, started: Instant) {
        self.ctx.activity.log_event(
            &self.session_id,
            None,
            &EventPayload::AgentResponse {
                content: content.to_string(),
                tokens: Some(usage.total_tokens() as u64),
                input_tokens: Some(usage.input_tokens as u64),
                output_tokens: Some(usage.output_tokens as u64),
                duration_ms: started.elapsed().as_millis() as u64,
                model: Some(self.model.definition().name.clone()),
                timestamp: Utc::now(),
            },
        );
    }
}

/// Run one delegated subagent to completion under its timeout.
///
/// A timed-out or cancelled child emits no `agent_response` of its own; the
/// parent's tool result records the outcome and the parent loop continues.
async fn run_delegation(
    index: usize,
    mut delegation: Delegation,
    cancel: CancellationToken,
) -> (usize, ToolResult) {
    let child_cancel = cancel.child_token();
    let started = Instant::now();
    let outcome = tokio::time::timeout(
        Duration::from_millis(delegation.timeout_ms),
        delegation.agent.process_input(&delegation.instructions, &child_cancel),
    )
    .await;
    let duration_ms = started.elapsed().as_millis() as u64;
    let result = match outcome {
        Err(_) => {
            // Stop any executor tasks the child left running.
            child_cancel.cancel();
            ToolResult::err(
                &delegation.call_id,
                format!("timed out after {}ms", delegation.timeout_ms),
                duration_ms,
            )
        }
        Ok(Err(e)) => {
            ToolResult::err(&delegation.call_id, format!("subagent failed: {e}"), duration_ms)
        }
        Ok(Ok(reply)) if reply.cancelled => ToolResult::cancelled(&delegation.call_id),
        Ok(Ok(reply)) => {
            ToolResult::ok(&delegation.call_id, Value::String(reply.content), duration_ms)
        }
    };
    (index, result)
}

/// Schema for the delegation tool, appended to the registry-derived tools
/// array on every model call.
fn delegation_schema() -> ToolSchema {
    ToolSchema {
        name: DELEGATE_TOOL_NAME.to_string(),
        description: "Delegate a focused subtask to a fresh subagent and return its final \
                      text output. The subagent shares this session's tools and stores but \
                      starts with a clean context."
            .to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "purpose": {
                    "type": "string",
                    "description": "Short label for what this delegation is for"
                },
                "instructions": {
                    "type": "string",
                    "description": "Complete instructions for the subagent"
                },
                "role": {
                    "type": "string",
                    "enum": ["general", "orchestrator", "planning", "reasoning", "execution"],
                    "description": "Role for the subagent; inferred from the instructions when omitted"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Budget in milliseconds (default 5 minutes)"
                }
            },
            "required": ["purpose", "instructions"]
        }),
    }
}

fn usage_record(usage: &Usage) -> UsageRecord {
    UsageRecord {
        input_tokens: usage.input_tokens as u64,
        output_tokens: usage.output_tokens as u64,
        total_tokens: usage.total_tokens() as u64,
    }
}
