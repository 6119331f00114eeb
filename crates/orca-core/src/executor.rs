// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use orca_config::RetryConfig;
use orca_model::ToolSchema;
use orca_tools::{ApprovalEngine, ApprovalRequest, ToolCall, ToolRegistry, ToolResult};

use crate::breaker::BreakerMap;
use crate::generation::Generation;
use crate::retry::RetryPolicy;

/// Bounded-parallel dispatcher for one batch of tool calls.
///
/// Each call independently passes approval and its tool's circuit breaker,
/// then runs through the registry under a semaphore of `max_concurrent`
/// permits.  Results come back positionally: slot `i` of the output always
/// answers call `i` of the input, regardless of completion order.  A failure
/// in one call never cancels its peers.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    approval: Arc<dyn ApprovalEngine>,
    breakers: Arc<BreakerMap>,
    retry: RetryPolicy,
    max_concurrent: usize,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        approval: Arc<dyn ApprovalEngine>,
        breakers: Arc<BreakerMap>,
        retry_config: RetryConfig,
        max_concurrent: usize,
    ) -> Self {
        Self {
            registry,
            approval,
            breakers,
            retry: RetryPolicy::new(retry_config),
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Execute a batch produced by one model turn.
    pub async fn execute_batch(
        &self,
        calls: &[ToolCall],
        session_id: &str,
        generation: &Generation,
        cancel: &CancellationToken,
    ) -> Vec<ToolResult> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let generation = generation.to_string();

        // One spawned task per call; a panic in one tool is isolated to its
        // own slot.  The semaphore enforces the concurrency cap.
        let mut tasks = Vec::with_capacity(calls.len());
        for call in calls.iter().cloned() {
            let registry = Arc::clone(&self.registry);
            let approval = Arc::clone(&self.approval);
            let breakers = Arc::clone(&self.breakers);
            let retry = self.retry.clone();
            let semaphore = Arc::clone(&semaphore);
            let session_id = session_id.to_string();
            let generation = generation.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                run_one(
                    call, registry, approval, breakers, retry, semaphore, session_id, generation,
                    cancel,
                )
                .await
            }));
        }

        let mut results = Vec::with_capacity(calls.len());
        for (i, task) in tasks.into_iter().enumerate() {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(call = %calls[i].name, error = %e, "tool task panicked");
                    ToolResult::err(&calls[i].id, format!("tool execution panicked: {e}"), 0)
                }
            };
            results.push(result);
        }
        results
    }

    /// Shape the registry's tool metadata into the model's tools array: one
    /// entry per `(tool, method)` pair with the combined name and a JSON
    /// Schema derived from the declared parameters.
    pub fn model_schemas(&self) -> Vec<ToolSchema> {
        self.registry
            .method_specs()
            .into_iter()
            .map(|(tool, method, spec)| {
                let method_spec = &spec.methods[&method];
                ToolSchema {
                    name: format!("{tool}_{method}"),
                    description: format!("{}: {}", spec.description, method_spec.description),
                    input_schema: method_spec.input_schema(),
                }
            })
            .collect()
    }

    /// One line per invokable method, for the system prompt.
    pub fn tool_summary(&self) -> String {
        let mut out = String::new();
        for (tool, method, spec) in self.registry.method_specs() {
            let method_spec = &spec.methods[&method];
            out.push_str(&format!("- {tool}_{method}: {}\n", method_spec.description));
        }
        out
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_one(
    call: ToolCall,
    registry: Arc<ToolRegistry>,
    approval: Arc<dyn ApprovalEngine>,
    breakers: Arc<BreakerMap>,
    retry: RetryPolicy,
    semaphore: Arc<Semaphore>,
    session_id: String,
    generation: String,
    cancel: CancellationToken,
) -> ToolResult {
    // 1. Approval, independent per call.
    let decision = approval.request_approval(&ApprovalRequest::for_call(call.clone())).await;
    if !decision.approved {
        let reason = decision.reason.unwrap_or_else(|| "approval denied".into());
        return ToolResult::denied(&call.id, reason);
    }
    let call = decision.modified_call.unwrap_or(call);

    // 2. Circuit breaker, keyed by the resolved tool name.  An open breaker
    //    short-circuits without invoking the tool and is never retried.
    let breaker_key = registry
        .resolve(&call.name)
        .map(|(_, tool, _)| tool)
        .unwrap_or_else(|_| call.name.clone());
    let breaker = breakers.breaker_for(&breaker_key);
    if breaker.check().blocked {
        return ToolResult::circuit_open(&call.id);
    }

    // 3. Bounded dispatch.  Pending calls abandon their slot on cancellation.
    let permit = tokio::select! {
        _ = cancel.cancelled() => None,
        permit = semaphore.acquire() => permit.ok(),
    };
    let Some(_permit) = permit else {
        return ToolResult::cancelled(&call.id);
    };

    let started = Instant::now();
    let outcome = tokio::select! {
        _ = cancel.cancelled() => None,
        outcome = retry.run(&cancel, || async {
            registry
                .call_tool_with_snapshots(&call.name, &call.input, &session_id, &generation)
                .await
                .map_err(anyhow::Error::new)
        }) => Some(outcome),
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    // 4. Breaker bookkeeping: one success or one failure per call, recorded
    //    after the retry budget is spent.  Cancellation records neither.
    match outcome {
        None => ToolResult::cancelled(&call.id),
        Some(Ok(value)) => {
            breaker.record_success();
            ToolResult::ok(&call.id, value, duration_ms)
        }
        Some(Err(e)) => {
            breaker.record_failure();
            ToolResult::err(&call.id, e.to_string(), duration_ms)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
