// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod breaker;
mod error;
mod executor;
mod generation;
mod handoff;
mod metrics;
mod orchestrator;
mod prompts;
mod retry;
mod roles;
#[cfg(test)]
mod tests;

pub use agent::{
    Agent, AgentContext, AgentReply, ModelResolver, SingleModelResolver, SpawnOptions,
    StopReason, DELEGATE_TOOL_NAME,
};
pub use breaker::{BreakerMap, BreakerState, CircuitBreaker};
pub use error::EngineError;
pub use executor::ToolExecutor;
pub use generation::Generation;
pub use handoff::{compress_history, truncate_head_tail};
pub use metrics::ConversationMetrics;
pub use orchestrator::Orchestrator;
pub use prompts::system_prompt;
pub use retry::{categorize, ErrorCategory, RetryPolicy};
pub use roles::{all_roles, choose_role_for_task, lookup_role, RoleDefinition};
