// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end tests for the orchestration engine.
///
/// Uses `ScriptedMockSession` so every scenario is deterministic and
/// requires no network access.  Stores are in-memory SQLite.
mod engine_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    use orca_config::{EngineConfig, RetryConfig};
    use orca_model::{
        MockSession, ModelDefinition, ModelSession, ScriptedMockSession, StreamEvent,
    };
    use orca_store::{ActivityLog, ConversationStore, EventFilter, EventType, MessageKind, NewMessage};
    use orca_tools::{
        AllowAllApprovals, MethodSpec, ParamKind, ParamSpec, PatternApprovalEngine, Tool,
        ToolRegistry, ToolSpec,
    };

    use crate::{
        Agent, AgentContext, BreakerState, EngineError, Generation, Orchestrator,
        SingleModelResolver, StopReason, lookup_role,
    };

    // ── Test tools ────────────────────────────────────────────────────────────

    /// Sleeps, tracks concurrent invocations, and returns `{"ok": <name>}`.
    struct SleepTool {
        name: &'static str,
        delay_ms: u64,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
        invocations: Arc<AtomicUsize>,
    }

    impl SleepTool {
        fn new(name: &'static str, delay_ms: u64) -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let max_active = Arc::new(AtomicUsize::new(0));
            let invocations = Arc::new(AtomicUsize::new(0));
            let tool = Self {
                name,
                delay_ms,
                active: Arc::new(AtomicUsize::new(0)),
                max_active: Arc::clone(&max_active),
                invocations: Arc::clone(&invocations),
            };
            (tool, max_active, invocations)
        }
    }

    #[async_trait]
    impl Tool for SleepTool {
        fn name(&self) -> &str {
            self.name
        }
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("test sleeper").method("run", MethodSpec::new("sleep then succeed"))
        }
        async fn invoke(&self, _method: &str, _params: &Value) -> anyhow::Result<Value> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(json!({ "ok": self.name }))
        }
    }

    /// Always fails; counts invocations.
    struct FailTool {
        invocations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for FailTool {
        fn name(&self) -> &str {
            "fail"
        }
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("test failure").method("run", MethodSpec::new("always fail"))
        }
        async fn invoke(&self, _method: &str, _params: &Value) -> anyhow::Result<Value> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("intentional failure")
        }
    }

    /// Requires a string parameter, for validation scenarios.
    struct StrictTool;

    #[async_trait]
    impl Tool for StrictTool {
        fn name(&self) -> &str {
            "strict"
        }
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("strict arguments").method(
                "go",
                MethodSpec::new("needs a path")
                    .param("path", ParamSpec::required(ParamKind::String)),
            )
        }
        async fn invoke(&self, _method: &str, params: &Value) -> anyhow::Result<Value> {
            Ok(json!({ "path": params["path"] }))
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn fast_config() -> EngineConfig {
        EngineConfig {
            retry: RetryConfig {
                max_retries: 3,
                base_delay_ms: 1,
                backoff_multiplier: 1.0,
                max_delay_ms: 2,
            },
            ..Default::default()
        }
    }

    struct Harness {
        agent: Agent,
        activity: Arc<ActivityLog>,
        conversation: Arc<ConversationStore>,
    }

    fn harness(model: Arc<dyn ModelSession>, registry: ToolRegistry, config: EngineConfig) -> Harness {
        let activity = Arc::new(ActivityLog::in_memory().unwrap());
        let conversation = Arc::new(ConversationStore::in_memory().unwrap());
        let registry = Arc::new(registry.with_activity_log(Arc::clone(&activity)));
        let ctx = AgentContext {
            activity: Arc::clone(&activity),
            conversation: Arc::clone(&conversation),
            registry,
            approval: Arc::new(AllowAllApprovals),
            models: Arc::new(SingleModelResolver(Arc::clone(&model))),
            config: Arc::new(config),
        };
        let agent = Agent::new(
            "s1",
            Generation::root(),
            lookup_role("general").unwrap(),
            model,
            ctx,
        );
        Harness { agent, activity, conversation }
    }

    /// All events for the session in insertion order: `(type, data)`.
    fn events_ascending(activity: &ActivityLog) -> Vec<(String, Value)> {
        let mut events = activity.get_recent_events(1_000).unwrap();
        events.reverse();
        events.into_iter().map(|e| (e.event_type, e.data)).collect()
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    // ── S1: simple single-turn, no tools ──────────────────────────────────────

    #[tokio::test]
    async fn s1_single_turn_without_tools() {
        let model = Arc::new(ScriptedMockSession::always_text("Hi"));
        let mut h = harness(model, ToolRegistry::new(), fast_config());

        let reply = h.agent.process_input("Hello", &token()).await.unwrap();
        assert_eq!(reply.content, "Hi");
        assert_eq!(reply.stop_reason, StopReason::EndTurn);
        assert!(!reply.cancelled);
        assert!(reply.tool_calls.is_empty());

        let history = h.conversation.get_conversation_history("s1", None).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, MessageKind::User);
        assert_eq!(history[0].content, "Hello");
        assert_eq!(history[1].role, MessageKind::Assistant);
        assert_eq!(history[1].content, "Hi");

        let types: Vec<String> =
            events_ascending(&h.activity).into_iter().map(|(t, _)| t).collect();
        assert_eq!(
            types,
            vec!["user_input", "model_request", "model_response", "agent_response"]
        );
    }

    #[tokio::test]
    async fn model_request_event_carries_serialized_prompt() {
        let model = Arc::new(ScriptedMockSession::always_text("ok"));
        let mut h = harness(model, ToolRegistry::new(), fast_config());
        h.agent.process_input("ping", &token()).await.unwrap();

        let requests = h
            .activity
            .get_events(&EventFilter {
                event_type: Some(EventType::ModelRequest),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(requests.len(), 1);
        let prompt = &requests[0].data["prompt"];
        assert!(prompt.is_array());
        let serialized = prompt.to_string();
        assert!(serialized.contains("ping"));
        assert_eq!(requests[0].data["provider"], "mock");
    }

    // ── S2: parallel tools in one batch ───────────────────────────────────────

    #[tokio::test]
    async fn s2_three_tools_run_in_parallel() {
        let mut registry = ToolRegistry::new();
        let (alpha, _, _) = SleepTool::new("alpha", 100);
        let (bravo, _, _) = SleepTool::new("bravo", 100);
        let (charlie, _, _) = SleepTool::new("charlie", 100);
        registry.register(alpha);
        registry.register(bravo);
        registry.register(charlie);

        let model = Arc::new(ScriptedMockSession::tools_then_text(
            &[
                ("cA", "alpha_run", "{}"),
                ("cB", "bravo_run", "{}"),
                ("cC", "charlie_run", "{}"),
            ],
            "all done",
        ));
        let mut h = harness(model, registry, fast_config());

        let started = Instant::now();
        let reply = h.agent.process_input("go", &token()).await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_millis(200), "not parallel: {elapsed:?}");

        assert_eq!(reply.content, "all done");
        let ids: Vec<&str> = reply.tool_results.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["cA", "cB", "cC"]);
        assert_eq!(reply.tool_results[0].data.as_ref().unwrap()["ok"], "alpha");
        assert_eq!(reply.tool_results[2].data.as_ref().unwrap()["ok"], "charlie");

        // All three starts precede any completion.
        let start_ids: Vec<i64> = h
            .activity
            .get_events(&EventFilter {
                event_type: Some(EventType::ToolExecutionStart),
                ..Default::default()
            })
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        let complete_ids: Vec<i64> = h
            .activity
            .get_events(&EventFilter {
                event_type: Some(EventType::ToolExecutionComplete),
                ..Default::default()
            })
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(start_ids.len(), 3);
        assert_eq!(complete_ids.len(), 3);
        let last_start = start_ids.iter().max().unwrap();
        let first_complete = complete_ids.iter().min().unwrap();
        assert!(last_start < first_complete);
    }

    // ── S3: concurrency cap ───────────────────────────────────────────────────

    #[tokio::test]
    async fn s3_six_tools_with_cap_two_run_staggered() {
        let mut registry = ToolRegistry::new();
        let (tool, max_active, _) = SleepTool::new("pace", 100);
        registry.register(tool);

        let calls: Vec<(String, &str, &str)> =
            (0..6).map(|i| (format!("c{i}"), "pace_run", "{}")).collect();
        let call_refs: Vec<(&str, &str, &str)> =
            calls.iter().map(|(id, n, a)| (id.as_str(), *n, *a)).collect();
        let model = Arc::new(ScriptedMockSession::tools_then_text(&call_refs, "done"));

        let mut config = fast_config();
        config.agent.max_concurrent_tools = Some(2);
        let mut h = harness(model, registry, config);

        let started = Instant::now();
        let reply = h.agent.process_input("go", &token()).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(reply.tool_results.len(), 6);
        assert!(reply.tool_results.iter().all(|r| r.success));
        assert!(elapsed >= Duration::from_millis(300), "finished too fast: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "too slow: {elapsed:?}");
        assert!(max_active.load(Ordering::SeqCst) <= 2);
    }

    // ── S4: mixed success and failure ─────────────────────────────────────────

    #[tokio::test]
    async fn s4_failure_is_isolated_and_fed_back() {
        let mut registry = ToolRegistry::new();
        let (ok_tool, _, _) = SleepTool::new("solid", 5);
        let fail_invocations = Arc::new(AtomicUsize::new(0));
        registry.register(ok_tool);
        registry.register(FailTool { invocations: Arc::clone(&fail_invocations) });

        let model = Arc::new(ScriptedMockSession::tools_then_text(
            &[("c1", "solid_run", "{}"), ("c2", "fail_run", "{}"), ("c3", "solid_run", "{}")],
            "handled",
        ));
        let mut h = harness(model, registry, fast_config());

        let reply = h.agent.process_input("go", &token()).await.unwrap();
        assert_eq!(reply.content, "handled");
        assert!(reply.tool_results[0].success);
        assert!(!reply.tool_results[1].success);
        assert!(reply.tool_results[1].error.as_ref().unwrap().contains("intentional failure"));
        assert!(reply.tool_results[2].success);

        // One breaker failure per call, recorded after the retry budget.
        assert_eq!(h.agent.breakers().breaker_for("fail").failures(), 1);
        // Budget of 3 retries → 4 invocations of the failing tool.
        assert_eq!(fail_invocations.load(Ordering::SeqCst), 4);

        // The model saw all three results as tool-result messages.
        let history = h.conversation.get_conversation_history("s1", None).unwrap();
        let tool_results: Vec<_> =
            history.iter().filter(|m| m.role == MessageKind::ToolResult).collect();
        assert_eq!(tool_results.len(), 3);
        assert!(tool_results[1].content.contains("intentional failure"));
    }

    // ── S5: circuit opens and short-circuits ──────────────────────────────────

    #[tokio::test]
    async fn s5_circuit_opens_after_threshold_and_blocks() {
        let mut registry = ToolRegistry::new();
        let invocations = Arc::new(AtomicUsize::new(0));
        registry.register(FailTool { invocations: Arc::clone(&invocations) });

        // Three rounds of calls to the failing tool, then a text wrap-up.
        let model = Arc::new(ScriptedMockSession::new(vec![
            orca_model::ScriptStep::Respond(ScriptedMockSession::tool_call_events(&[(
                "c1", "fail_run", "{}",
            )])),
            orca_model::ScriptStep::Respond(ScriptedMockSession::tool_call_events(&[(
                "c2", "fail_run", "{}",
            )])),
            orca_model::ScriptStep::Respond(ScriptedMockSession::tool_call_events(&[(
                "c3", "fail_run", "{}",
            )])),
            orca_model::ScriptStep::Respond(ScriptedMockSession::text_events("giving up")),
        ]));

        let mut config = fast_config();
        config.retry.max_retries = 0;
        config.breaker.failure_threshold = 2;
        let mut h = harness(model, registry, config);

        let reply = h.agent.process_input("go", &token()).await.unwrap();
        assert_eq!(reply.content, "giving up");

        // Two real invocations opened the breaker; the third call was
        // short-circuited without touching the tool.
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
        assert_eq!(h.agent.breakers().breaker_for("fail").state(), BreakerState::Open);
        assert_eq!(reply.tool_results[2].error.as_deref(), Some("circuit_open"));
        let circuit_json = reply.tool_results[2].to_model_json();
        assert_eq!(circuit_json["recovered"], false);
    }

    // ── S6: subagent delegation ───────────────────────────────────────────────

    #[tokio::test]
    async fn s6_delegation_spawns_child_with_shared_session() {
        // Step 1: parent requests a delegation.  Step 2 is consumed by the
        // child ("done").  Step 3: parent wraps up.
        let model = Arc::new(ScriptedMockSession::new(vec![
            orca_model::ScriptStep::Respond(ScriptedMockSession::tool_call_events(&[(
                "d1",
                "agent_delegate",
                r#"{"purpose":"plan","instructions":"design a retry policy"}"#,
            )])),
            orca_model::ScriptStep::Respond(ScriptedMockSession::text_events("done")),
            orca_model::ScriptStep::Respond(ScriptedMockSession::text_events("parent done")),
        ]));
        let mut h = harness(model, ToolRegistry::new(), fast_config());

        let reply = h.agent.process_input("delegate something", &token()).await.unwrap();
        assert_eq!(reply.content, "parent done");

        // The child's final text became the tool result.
        assert_eq!(reply.tool_results.len(), 1);
        assert!(reply.tool_results[0].success);
        assert_eq!(reply.tool_results[0].data, Some(Value::String("done".into())));

        // Child generation extends the parent lineage: 0 → 0.1.
        assert_eq!(h.agent.subagent_count(), 1);
        assert_eq!(h.agent.generation().child(1).to_string(), "0.1");
        let child_history =
            h.conversation.get_generation_history("s1", "0.1").unwrap();
        assert!(!child_history.is_empty());
        assert!(child_history.iter().any(|m| m.content == "design a retry policy"));

        // Child events share the parent's session id.
        let user_inputs = h
            .activity
            .get_events(&EventFilter {
                session_id: Some("s1".into()),
                event_type: Some(EventType::UserInput),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(user_inputs.len(), 2);
        assert!(user_inputs.iter().any(|e| e.data["content"] == "design a retry policy"));
        let responses = h
            .activity
            .get_events(&EventFilter {
                session_id: Some("s1".into()),
                event_type: Some(EventType::ModelResponse),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(responses.len(), 3);
    }

    #[tokio::test]
    async fn delegation_timeout_produces_error_result() {
        // The child pops a script step that requests a very slow tool.
        let mut registry = ToolRegistry::new();
        let (slow, _, _) = SleepTool::new("slow", 60_000);
        registry.register(slow);

        let model = Arc::new(ScriptedMockSession::new(vec![
            orca_model::ScriptStep::Respond(ScriptedMockSession::tool_call_events(&[(
                "d1",
                "agent_delegate",
                r#"{"purpose":"stall","instructions":"run the slow thing","timeout":100}"#,
            )])),
            // Child round: call the slow tool (this stalls past the timeout).
            orca_model::ScriptStep::Respond(ScriptedMockSession::tool_call_events(&[(
                "c1", "slow_run", "{}",
            )])),
            // Parent wrap-up after the timeout error.
            orca_model::ScriptStep::Respond(ScriptedMockSession::text_events("gave up")),
        ]));
        let mut h = harness(model, registry, fast_config());

        let started = Instant::now();
        let reply = h.agent.process_input("go", &token()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(reply.content, "gave up");
        assert!(!reply.tool_results[0].success);
        assert!(reply.tool_results[0].error.as_ref().unwrap().contains("timed out after 100ms"));
    }

    #[tokio::test]
    async fn delegation_without_instructions_fails_cleanly() {
        let model = Arc::new(ScriptedMockSession::new(vec![
            orca_model::ScriptStep::Respond(ScriptedMockSession::tool_call_events(&[(
                "d1",
                "agent_delegate",
                r#"{"purpose":"oops"}"#,
            )])),
            orca_model::ScriptStep::Respond(ScriptedMockSession::text_events("recovered")),
        ]));
        let mut h = harness(model, ToolRegistry::new(), fast_config());
        let reply = h.agent.process_input("go", &token()).await.unwrap();
        assert_eq!(reply.content, "recovered");
        assert!(!reply.tool_results[0].success);
        assert!(reply.tool_results[0].error.as_ref().unwrap().contains("instructions"));
        assert_eq!(h.agent.subagent_count(), 0);
    }

    // ── Retry and failure semantics ───────────────────────────────────────────

    #[tokio::test]
    async fn model_rate_limit_is_retried_to_success() {
        let model = Arc::new(ScriptedMockSession::fail_times_then_text(
            2,
            "rate limit exceeded",
            "recovered",
        ));
        let calls = Arc::clone(&model);
        let mut h = harness(model, ToolRegistry::new(), fast_config());
        let reply = h.agent.process_input("go", &token()).await.unwrap();
        assert_eq!(reply.content, "recovered");
        assert_eq!(calls.calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn non_retriable_model_error_fails_immediately() {
        let model = Arc::new(ScriptedMockSession::fail_times_then_text(
            5,
            "401 unauthorized: bad api key",
            "never reached",
        ));
        let calls = Arc::clone(&model);
        let mut h = harness(model, ToolRegistry::new(), fast_config());
        let err = h.agent.process_input("go", &token()).await.unwrap_err();
        assert!(matches!(err, EngineError::ModelCallFailed(_)));
        assert_eq!(calls.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn exhausted_model_retries_surface_failure() {
        let model = Arc::new(ScriptedMockSession::fail_times_then_text(
            10,
            "connection reset",
            "never reached",
        ));
        let calls = Arc::clone(&model);
        let mut h = harness(model, ToolRegistry::new(), fast_config());
        let err = h.agent.process_input("go", &token()).await.unwrap_err();
        assert!(matches!(err, EngineError::ModelCallFailed(_)));
        // Initial attempt + 3 retries.
        assert_eq!(calls.calls.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn validation_error_feeds_back_without_retry() {
        let mut registry = ToolRegistry::new();
        registry.register(StrictTool);
        let model = Arc::new(ScriptedMockSession::tools_then_text(
            &[("c1", "strict_go", r#"{"wrong":"field"}"#)],
            "noted",
        ));
        let mut h = harness(model, registry, fast_config());
        let reply = h.agent.process_input("go", &token()).await.unwrap();
        assert_eq!(reply.content, "noted");
        assert!(!reply.tool_results[0].success);
        assert!(reply.tool_results[0].error.as_ref().unwrap().contains("invalid parameters"));
    }

    // ── Iteration limit ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn iteration_limit_is_a_controlled_stop() {
        let mut registry = ToolRegistry::new();
        let (tool, _, invocations) = SleepTool::new("busy", 1);
        registry.register(tool);

        // Every round requests another tool call; the loop must cut it off.
        let steps: Vec<orca_model::ScriptStep> = (0..10)
            .map(|i| {
                orca_model::ScriptStep::Respond(ScriptedMockSession::tool_call_events(&[(
                    &format!("c{i}"),
                    "busy_run",
                    "{}",
                )]))
            })
            .collect();
        let model = Arc::new(ScriptedMockSession::new(steps));

        let mut config = fast_config();
        config.agent.max_iterations = 3;
        let mut h = harness(model, registry, config);

        let reply = h.agent.process_input("loop forever", &token()).await.unwrap();
        assert_eq!(reply.stop_reason, StopReason::IterationLimit);
        assert!(reply.content.contains("iteration_limit_reached"));
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        // The controlled stop still emits the turn's agent_response.
        let responses = h
            .activity
            .get_events(&EventFilter {
                event_type: Some(EventType::AgentResponse),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(responses.len(), 1);
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn cancellation_returns_cancelled_reply() {
        let mut registry = ToolRegistry::new();
        let (tool, _, _) = SleepTool::new("slowpoke", 30_000);
        registry.register(tool);
        let model = Arc::new(ScriptedMockSession::tools_then_text(
            &[("c1", "slowpoke_run", "{}")],
            "never reached",
        ));
        let mut h = harness(model, registry, fast_config());

        let cancel = token();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let reply = h.agent.process_input("go", &cancel).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(reply.cancelled);
        assert_eq!(reply.content, "<cancelled>");
        assert_eq!(reply.stop_reason, StopReason::Cancelled);
    }

    #[tokio::test]
    async fn pre_cancelled_turn_returns_immediately() {
        let model = Arc::new(ScriptedMockSession::always_text("never"));
        let mut h = harness(model, ToolRegistry::new(), fast_config());
        let cancel = token();
        cancel.cancel();
        let reply = h.agent.process_input("go", &cancel).await.unwrap();
        assert!(reply.cancelled);
    }

    // ── Handoff and context overflow ──────────────────────────────────────────

    fn tiny_window_session(context_window: u32, reply: &str) -> Arc<ScriptedMockSession> {
        Arc::new(
            ScriptedMockSession::always_text(reply).with_definition(ModelDefinition {
                context_window,
                ..ModelDefinition::mock()
            }),
        )
    }

    #[tokio::test]
    async fn oversized_history_triggers_handoff_to_successor() {
        let model = tiny_window_session(800, "after handoff");
        let mut h = harness(model, ToolRegistry::new(), fast_config());

        // Pre-existing history large enough to cross 80% of an 800-token
        // window once the system prompt and delegation schema are added.
        for i in 0..40 {
            h.conversation
                .save_message(&NewMessage::text(
                    "s1",
                    "0",
                    MessageKind::User,
                    &format!("padding message {i} {}", "x".repeat(60)),
                ))
                .unwrap();
        }

        let reply = h.agent.process_input("continue the work", &token()).await.unwrap();
        assert_eq!(reply.content, "after handoff");

        let handoff = h.conversation.latest_handoff("s1").unwrap().unwrap();
        assert_eq!(handoff.generation, "0");
        assert!(handoff.compressed_context.contains("Context handoff"));
        assert_eq!(handoff.reason, "context threshold exceeded");

        // The successor is a child generation and produced the reply.
        assert_eq!(h.agent.subagent_count(), 1);
        let successor_msgs = h.conversation.get_generation_history("s1", "0.1").unwrap();
        assert!(successor_msgs.iter().any(|m| m.content == "after handoff"));
    }

    #[tokio::test]
    async fn unrecoverable_overflow_fails_with_context_overflow() {
        // A 100-token window cannot even hold the system prompt; the handoff
        // successor overflows again and the turn fails explicitly.
        let model = tiny_window_session(100, "unreachable");
        let mut h = harness(model, ToolRegistry::new(), fast_config());
        let err = h.agent.process_input("hello", &token()).await.unwrap_err();
        assert!(matches!(err, EngineError::ContextOverflow { .. }));
    }

    // ── Approval policy integration ───────────────────────────────────────────

    #[tokio::test]
    async fn denied_tool_call_is_synthesized_and_loop_continues() {
        let mut registry = ToolRegistry::new();
        let (tool, _, invocations) = SleepTool::new("danger", 1);
        registry.register(tool);

        let activity = Arc::new(ActivityLog::in_memory().unwrap());
        let conversation = Arc::new(ConversationStore::in_memory().unwrap());
        let registry = Arc::new(registry.with_activity_log(Arc::clone(&activity)));
        let model: Arc<dyn ModelSession> = Arc::new(ScriptedMockSession::tools_then_text(
            &[("c1", "danger_run", "{}")],
            "acknowledged",
        ));
        let ctx = AgentContext {
            activity,
            conversation,
            registry,
            approval: Arc::new(PatternApprovalEngine::new(
                &[],
                &["danger_*".to_string()],
                true,
            )),
            models: Arc::new(SingleModelResolver(Arc::clone(&model))),
            config: Arc::new(fast_config()),
        };
        let mut agent = Agent::new(
            "s1",
            Generation::root(),
            lookup_role("general").unwrap(),
            model,
            ctx,
        );

        let reply = agent.process_input("try it", &token()).await.unwrap();
        assert_eq!(reply.content, "acknowledged");
        assert!(reply.tool_results[0].denied);
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
        let fed_back = reply.tool_results[0].to_model_json();
        assert_eq!(fed_back["denied"], true);
    }

    // ── Orchestrator ──────────────────────────────────────────────────────────

    fn orchestrator_with(model: Arc<dyn ModelSession>) -> Arc<Orchestrator> {
        let activity = Arc::new(ActivityLog::in_memory().unwrap());
        let conversation = Arc::new(ConversationStore::in_memory().unwrap());
        let registry = Arc::new(ToolRegistry::new().with_activity_log(Arc::clone(&activity)));
        Arc::new(Orchestrator::new(
            model,
            registry,
            Arc::new(AllowAllApprovals),
            activity,
            conversation,
            Arc::new(fast_config()),
        ))
    }

    #[tokio::test]
    async fn orchestrator_routes_one_turn() {
        let orch = orchestrator_with(Arc::new(MockSession::default()));
        let session_id = orch.start_session().unwrap();
        let reply = orch.process_input(&session_id, "hello there", &token()).await.unwrap();
        assert!(reply.content.contains("hello there"));

        let history = orch.conversation().get_conversation_history(&session_id, None).unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn orchestrator_sessions_are_isolated() {
        let orch = orchestrator_with(Arc::new(MockSession::default()));
        let a = orch.start_session().unwrap();
        let b = orch.start_session().unwrap();
        orch.process_input(&a, "first", &token()).await.unwrap();
        orch.process_input(&b, "second", &token()).await.unwrap();
        let history_a = orch.conversation().get_conversation_history(&a, None).unwrap();
        assert_eq!(history_a.len(), 2);
        assert_eq!(history_a[0].content, "first");
    }

    #[tokio::test]
    async fn second_concurrent_turn_is_rejected() {
        let mut registry = ToolRegistry::new();
        let (slow, _, _) = SleepTool::new("slow", 500);
        registry.register(slow);

        let activity = Arc::new(ActivityLog::in_memory().unwrap());
        let conversation = Arc::new(ConversationStore::in_memory().unwrap());
        let registry = Arc::new(registry.with_activity_log(Arc::clone(&activity)));
        let model: Arc<dyn ModelSession> = Arc::new(ScriptedMockSession::tools_then_text(
            &[("c1", "slow_run", "{}")],
            "finished",
        ));
        let orch = Arc::new(Orchestrator::new(
            model,
            registry,
            Arc::new(AllowAllApprovals),
            activity,
            conversation,
            Arc::new(fast_config()),
        ));
        let session_id = orch.start_session().unwrap();

        let first = {
            let orch = Arc::clone(&orch);
            let session_id = session_id.clone();
            tokio::spawn(async move { orch.process_input(&session_id, "turn one", &token()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = orch.process_input(&session_id, "turn two", &token()).await;
        assert!(matches!(second, Err(EngineError::ConcurrentTurnRejected)));

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.content, "finished");
    }

    // ── Metrics and cost accounting ───────────────────────────────────────────

    #[tokio::test]
    async fn model_response_event_carries_cost() {
        let model = Arc::new(ScriptedMockSession::new(vec![orca_model::ScriptStep::Respond(
            vec![
                StreamEvent::Token("priced".into()),
                StreamEvent::Usage(orca_model::Usage {
                    input_tokens: 1_000_000,
                    output_tokens: 1_000_000,
                    ..Default::default()
                }),
                StreamEvent::Done,
            ],
        )]));
        let mut h = harness(model, ToolRegistry::new(), fast_config());
        h.agent.process_input("go", &token()).await.unwrap();

        let responses = h
            .activity
            .get_events(&EventFilter {
                event_type: Some(EventType::ModelResponse),
                ..Default::default()
            })
            .unwrap();
        // Mock pricing: 3.0 in + 15.0 out per million tokens.
        assert_eq!(responses[0].data["cost"], 18.0);
        assert_eq!(responses[0].data["tokens_in"], 1_000_000);
        assert_eq!(h.agent.metrics().total_tokens_used, 2_000_000);
    }

    #[tokio::test]
    async fn cache_metrics_accumulate_from_usage() {
        let model = Arc::new(ScriptedMockSession::new(vec![orca_model::ScriptStep::Respond(
            vec![
                StreamEvent::Token("ok".into()),
                StreamEvent::Usage(orca_model::Usage {
                    input_tokens: 10,
                    output_tokens: 10,
                    cache_read_tokens: 2,
                    cache_write_tokens: 1,
                }),
                StreamEvent::Done,
            ],
        )]));
        let mut h = harness(model, ToolRegistry::new(), fast_config());
        h.agent.process_input("go", &token()).await.unwrap();
        assert_eq!(h.agent.metrics().cache_hit_rate(), "66.7%");
    }

    // ── Empty-turn nudge ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn empty_model_turn_is_nudged_then_recovers() {
        let model = Arc::new(ScriptedMockSession::new(vec![
            orca_model::ScriptStep::Respond(vec![StreamEvent::Done]),
            orca_model::ScriptStep::Respond(ScriptedMockSession::text_events("second try")),
        ]));
        let calls = Arc::clone(&model);
        let mut h = harness(model, ToolRegistry::new(), fast_config());
        let reply = h.agent.process_input("go", &token()).await.unwrap();
        assert_eq!(reply.content, "second try");
        assert_eq!(calls.calls.load(Ordering::Relaxed), 2);
    }

    // ── Task analysis entry point ─────────────────────────────────────────────

    #[test]
    fn choose_agent_for_task_maps_keywords() {
        assert_eq!(
            Agent::choose_agent_for_task("analyze this bug and explain the root cause").name,
            "reasoning"
        );
        assert_eq!(Agent::choose_agent_for_task("plan the migration").name, "planning");
        assert_eq!(Agent::choose_agent_for_task("run all checks").name, "execution");
        assert_eq!(Agent::choose_agent_for_task("hello world").name, "general");
    }
}
