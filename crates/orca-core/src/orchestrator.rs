// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use orca_config::EngineConfig;
use orca_model::ModelSession;
use orca_store::{ActivityLog, ConversationStore};
use orca_tools::{ApprovalEngine, ToolRegistry};

use crate::agent::{Agent, AgentContext, AgentReply, ModelResolver, SingleModelResolver};
use crate::error::EngineError;
use crate::generation::Generation;
use crate::roles::lookup_role;

const ROOT_ROLE: &str = "orchestrator";

struct SessionSlot {
    /// Turn lock: held for the whole turn so a second `process_input` on
    /// the same session is rejected instead of queued.
    agent: tokio::sync::Mutex<Agent>,
}

/// Process-wide entry point.
///
/// Owns the shared activity log, conversation store, tool registry, and
/// approval engine, and the root agent of every session.  Routes one user
/// message at a time per session to a final reply.
pub struct Orchestrator {
    ctx: AgentContext,
    sessions: Mutex<HashMap<String, Arc<SessionSlot>>>,
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn ModelSession>,
        registry: Arc<ToolRegistry>,
        approval: Arc<dyn ApprovalEngine>,
        activity: Arc<ActivityLog>,
        conversation: Arc<ConversationStore>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self::with_resolver(
            Arc::new(SingleModelResolver(model)),
            registry,
            approval,
            activity,
            conversation,
            config,
        )
    }

    pub fn with_resolver(
        models: Arc<dyn ModelResolver>,
        registry: Arc<ToolRegistry>,
        approval: Arc<dyn ApprovalEngine>,
        activity: Arc<ActivityLog>,
        conversation: Arc<ConversationStore>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            ctx: AgentContext { activity, conversation, registry, approval, models, config },
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create a new session and return its id.  A session may also be
    /// created implicitly by the first `process_input` with a fresh id.
    pub fn start_session(&self) -> Result<String, EngineError> {
        let session_id = Uuid::new_v4().to_string();
        self.slot(&session_id)?;
        Ok(session_id)
    }

    /// Route one user message through the session's root agent.
    ///
    /// Turns on one session are strictly sequential: a second call before
    /// the first returns fails with [`EngineError::ConcurrentTurnRejected`].
    pub async fn process_input(
        &self,
        session_id: &str,
        user_message: &str,
        cancel: &CancellationToken,
    ) -> Result<AgentReply, EngineError> {
        let slot = self.slot(session_id)?;
        let mut agent =
            slot.agent.try_lock().map_err(|_| EngineError::ConcurrentTurnRejected)?;
        agent.process_input(user_message, cancel).await
    }

    pub fn activity(&self) -> &Arc<ActivityLog> {
        &self.ctx.activity
    }

    pub fn conversation(&self) -> &Arc<ConversationStore> {
        &self.ctx.conversation
    }

    fn slot(&self, session_id: &str) -> Result<Arc<SessionSlot>, EngineError> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(slot) = sessions.get(session_id) {
            return Ok(Arc::clone(slot));
        }
        let role = lookup_role(ROOT_ROLE)
            .ok_or_else(|| EngineError::SpawnFailed(format!("missing role '{ROOT_ROLE}'")))?;
        let model = self
            .ctx
            .models
            .resolve(role.default_provider, role.default_model)
            .map_err(|e| EngineError::SpawnFailed(e.to_string()))?;
        let agent =
            Agent::new(session_id.to_string(), Generation::root(), role, model, self.ctx.clone());
        let slot = Arc::new(SessionSlot { agent: tokio::sync::Mutex::new(agent) });
        sessions.insert(session_id.to_string(), Arc::clone(&slot));
        Ok(slot)
    }
}
