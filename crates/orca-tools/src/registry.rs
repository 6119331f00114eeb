// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use orca_config::SnapshotConfig;
use orca_store::{ActivityLog, EventPayload, SnapshotPhase};

use crate::tool::{MethodSpec, Tool, ToolError, ToolSpec};

/// Pre/post project-snapshot seam around tool execution.
///
/// Snapshot capture and restore live outside the engine; the registry only
/// drives this hook and reports its failures as `snapshot_error` activity
/// events.  A failing hook never fails the tool call.
#[async_trait]
pub trait SnapshotHook: Send + Sync {
    async fn pre_tool(&self, tool: &str, method: &str, params: &Value) -> anyhow::Result<()>;
    async fn post_tool(
        &self,
        tool: &str,
        method: &str,
        result: Option<&Value>,
        error: Option<&str>,
    ) -> anyhow::Result<()>;
}

/// Central registry holding all available tools.
///
/// Read-mostly after initialization; registration after startup is permitted
/// and becomes visible to subsequent calls (callers hold the registry behind
/// an `Arc`, so late registration happens before that `Arc` is shared).
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    activity: Option<Arc<ActivityLog>>,
    snapshots: Option<Arc<dyn SnapshotHook>>,
    snapshot_config: SnapshotConfig,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            activity: None,
            snapshots: None,
            snapshot_config: SnapshotConfig::default(),
        }
    }

    /// Attach the activity log used for tool execution events.
    pub fn with_activity_log(mut self, activity: Arc<ActivityLog>) -> Self {
        self.activity = Some(activity);
        self
    }

    /// Attach a snapshot hook and its configuration.
    pub fn with_snapshot_hook(mut self, hook: Arc<dyn SnapshotHook>, config: SnapshotConfig) -> Self {
        self.snapshots = Some(hook);
        self.snapshot_config = config;
        self
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list_tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_tool_spec(&self, name: &str) -> Option<ToolSpec> {
        self.tools.get(name).map(|t| t.spec())
    }

    /// All `(tool, method, spec)` triples, sorted by combined name.  The
    /// executor shapes these into the model's tools array.
    pub fn method_specs(&self) -> Vec<(String, String, ToolSpec)> {
        let mut entries: Vec<(String, String, ToolSpec)> = Vec::new();
        for tool in self.tools.values() {
            let spec = tool.spec();
            for method in spec.methods.keys() {
                entries.push((tool.name().to_string(), method.clone(), spec.clone()));
            }
        }
        entries.sort_by(|a, b| format!("{}_{}", a.0, a.1).cmp(&format!("{}_{}", b.0, b.1)));
        entries
    }

    /// Resolve a combined `<tool>_<method>` name.
    ///
    /// Tool names may themselves contain underscores, so resolution picks
    /// the longest registered tool name that prefixes the combined form.
    pub fn resolve(&self, combined: &str) -> Result<(Arc<dyn Tool>, String, String), ToolError> {
        let mut best: Option<(&String, &Arc<dyn Tool>)> = None;
        for (name, tool) in &self.tools {
            let prefix = format!("{name}_");
            if combined.starts_with(&prefix)
                && best.map_or(true, |(b, _)| name.len() > b.len())
            {
                best = Some((name, tool));
            }
        }
        match best {
            Some((name, tool)) => {
                let method = combined[name.len() + 1..].to_string();
                Ok((Arc::clone(tool), name.clone(), method))
            }
            None => Err(ToolError::UnknownTool(combined.to_string())),
        }
    }

    /// Invoke a tool by combined name after validating parameters.
    ///
    /// When `session_id` is present, `tool_execution_start` and
    /// `tool_execution_complete` events bracket the call regardless of the
    /// outcome.  Errors propagate to the caller and are also logged.
    pub async fn call_tool(
        &self,
        name: &str,
        params: &Value,
        session_id: Option<&str>,
    ) -> Result<Value, ToolError> {
        let (tool, tool_name, method) = self.resolve(name)?;

        if let (Some(activity), Some(session_id)) = (&self.activity, session_id) {
            activity.log_event(
                session_id,
                None,
                &EventPayload::ToolExecutionStart {
                    tool: tool_name.clone(),
                    method: method.clone(),
                    params: params.clone(),
                },
            );
        }

        let started = Instant::now();
        let outcome = self.validate_and_invoke(&tool, &tool_name, &method, params).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        if let (Some(activity), Some(session_id)) = (&self.activity, session_id) {
            let (success, result, error) = match &outcome {
                Ok(v) => (true, v.clone(), None),
                Err(e) => (false, Value::Null, Some(e.to_string())),
            };
            activity.log_event(
                session_id,
                None,
                &EventPayload::ToolExecutionComplete { success, result, error, duration_ms },
            );
        }

        if let Err(e) = &outcome {
            warn!(tool = %tool_name, method = %method, error = %e, "tool call failed");
        }
        outcome
    }

    async fn validate_and_invoke(
        &self,
        tool: &Arc<dyn Tool>,
        tool_name: &str,
        method: &str,
        params: &Value,
    ) -> Result<Value, ToolError> {
        let spec = tool.spec();
        let method_spec = spec.methods.get(method).ok_or_else(|| ToolError::UnknownMethod {
            tool: tool_name.to_string(),
            method: method.to_string(),
        })?;
        validate_params(method_spec, params)?;
        tool.invoke(method, params).await.map_err(ToolError::Execution)
    }

    /// Split-form variant of [`call_tool`].
    ///
    /// [`call_tool`]: ToolRegistry::call_tool
    pub async fn call_method(
        &self,
        tool: &str,
        method: &str,
        params: &Value,
        session_id: Option<&str>,
    ) -> Result<Value, ToolError> {
        self.call_tool(&format!("{tool}_{method}"), params, session_id).await
    }

    /// Like [`call_tool`] but bracketed with the configured snapshot hook.
    ///
    /// Hook failures emit a `snapshot_error` event and execution continues
    /// as if the hook were absent; a tool error still propagates unchanged.
    ///
    /// [`call_tool`]: ToolRegistry::call_tool
    pub async fn call_tool_with_snapshots(
        &self,
        name: &str,
        params: &Value,
        session_id: &str,
        _generation: &str,
    ) -> Result<Value, ToolError> {
        let resolved = self.resolve(name)?;
        let (_, tool_name, method) = &resolved;

        if self.snapshot_config.enable_pre_tool_snapshots {
            if let Some(hook) = &self.snapshots {
                if let Err(e) = hook.pre_tool(tool_name, method, params).await {
                    self.report_snapshot_error(session_id, SnapshotPhase::PreTool, &e);
                }
            }
        }

        let outcome = self.call_tool(name, params, Some(session_id)).await;

        let want_post = match &outcome {
            Ok(_) => self.snapshot_config.enable_post_tool_snapshots,
            Err(_) => {
                self.snapshot_config.enable_post_tool_snapshots
                    || self.snapshot_config.snapshot_on_errors
            }
        };
        if want_post {
            if let Some(hook) = &self.snapshots {
                let (result, error) = match &outcome {
                    Ok(v) => (Some(v), None),
                    Err(e) => (None, Some(e.to_string())),
                };
                if let Err(e) = hook.post_tool(tool_name, method, result, error.as_deref()).await {
                    self.report_snapshot_error(session_id, SnapshotPhase::PostTool, &e);
                }
            }
        }

        outcome
    }

    fn report_snapshot_error(&self, session_id: &str, phase: SnapshotPhase, error: &anyhow::Error) {
        warn!(?phase, %error, "snapshot hook failed; continuing without snapshot");
        if let Some(activity) = &self.activity {
            activity.log_event(
                session_id,
                None,
                &EventPayload::SnapshotError { error: error.to_string(), phase },
            );
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate `params` against a method's declared parameter specs.
///
/// Missing required parameter, unknown parameter, and kind mismatch each
/// fail before the tool is invoked.
fn validate_params(spec: &MethodSpec, params: &Value) -> Result<(), ToolError> {
    let obj = match params {
        Value::Object(map) => map,
        Value::Null => {
            // No arguments: valid only when nothing is required.
            if let Some((name, _)) = spec.params.iter().find(|(_, p)| p.required) {
                return Err(ToolError::Validation(format!("missing required parameter '{name}'")));
            }
            return Ok(());
        }
        other => {
            return Err(ToolError::Validation(format!(
                "parameters must be an object, got {other}"
            )))
        }
    };

    for (name, p) in &spec.params {
        match obj.get(name) {
            None if p.required => {
                return Err(ToolError::Validation(format!("missing required parameter '{name}'")))
            }
            Some(value) if !p.kind.matches(value) => {
                return Err(ToolError::Validation(format!(
                    "parameter '{name}' expects {}, got {value}",
                    p.kind.as_str()
                )))
            }
            _ => {}
        }
    }
    for key in obj.keys() {
        if !spec.params.contains_key(key) {
            return Err(ToolError::Validation(format!("unknown parameter '{key}'")));
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::tool::{ParamKind, ParamSpec};
    use orca_store::{EventFilter, EventType};

    /// Minimal echo tool with one method: `echo_say { text: string }`.
    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("echoes its input").method(
                "say",
                MethodSpec::new("repeat the given text")
                    .param("text", ParamSpec::required(ParamKind::String))
                    .param("upper", ParamSpec::optional(ParamKind::Boolean)),
            )
        }
        async fn invoke(&self, method: &str, params: &Value) -> anyhow::Result<Value> {
            assert_eq!(method, "say");
            let text = params["text"].as_str().unwrap_or_default();
            let upper = params["upper"].as_bool().unwrap_or(false);
            Ok(json!({ "said": if upper { text.to_uppercase() } else { text.to_string() } }))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "flaky"
        }
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("always fails").method("run", MethodSpec::new("fail"))
        }
        async fn invoke(&self, _method: &str, _params: &Value) -> anyhow::Result<Value> {
            anyhow::bail!("intentional failure")
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        reg
    }

    #[tokio::test]
    async fn call_tool_combined_name() {
        let reg = registry();
        let out = reg.call_tool("echo_say", &json!({"text": "hi"}), None).await.unwrap();
        assert_eq!(out["said"], "hi");
    }

    #[tokio::test]
    async fn call_method_split_form() {
        let reg = registry();
        let out = reg.call_method("echo", "say", &json!({"text": "hi"}), None).await.unwrap();
        assert_eq!(out["said"], "hi");
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let reg = registry();
        let err = reg.call_tool("nope_say", &json!({}), None).await.unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let reg = registry();
        let err = reg.call_tool("echo_shout", &json!({}), None).await.unwrap_err();
        assert!(matches!(err, ToolError::UnknownMethod { .. }));
    }

    #[tokio::test]
    async fn missing_required_parameter_fails_before_invoke() {
        let reg = registry();
        let err = reg.call_tool("echo_say", &json!({}), None).await.unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_parameter_fails_validation() {
        let reg = registry();
        let err = reg
            .call_tool("echo_say", &json!({"text": "hi", "volume": 11}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));
    }

    #[tokio::test]
    async fn type_mismatch_fails_validation() {
        let reg = registry();
        let err = reg.call_tool("echo_say", &json!({"text": 42}), None).await.unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));
    }

    #[tokio::test]
    async fn longest_tool_name_prefix_wins() {
        struct NamedTool(&'static str);

        #[async_trait]
        impl Tool for NamedTool {
            fn name(&self) -> &str {
                self.0
            }
            fn spec(&self) -> ToolSpec {
                ToolSpec::new("t").method("go", MethodSpec::new("go"))
            }
            async fn invoke(&self, _m: &str, _p: &Value) -> anyhow::Result<Value> {
                Ok(json!({"tool": self.0}))
            }
        }

        let mut reg = ToolRegistry::new();
        reg.register(NamedTool("file"));
        reg.register(NamedTool("file_system"));
        let out = reg.call_tool("file_system_go", &json!({}), None).await.unwrap();
        assert_eq!(out["tool"], "file_system");
    }

    #[tokio::test]
    async fn events_bracket_successful_call() {
        let activity = Arc::new(ActivityLog::in_memory().unwrap());
        let mut reg = ToolRegistry::new().with_activity_log(Arc::clone(&activity));
        reg.register(EchoTool);
        reg.call_tool("echo_say", &json!({"text": "hi"}), Some("s1")).await.unwrap();

        let start = activity
            .get_events(&EventFilter {
                event_type: Some(EventType::ToolExecutionStart),
                ..Default::default()
            })
            .unwrap();
        let complete = activity
            .get_events(&EventFilter {
                event_type: Some(EventType::ToolExecutionComplete),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(start.len(), 1);
        assert_eq!(start[0].data["tool"], "echo");
        assert_eq!(start[0].data["method"], "say");
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].data["success"], true);
        assert!(start[0].id < complete[0].id);
    }

    #[tokio::test]
    async fn completion_event_emitted_on_failure_too() {
        let activity = Arc::new(ActivityLog::in_memory().unwrap());
        let mut reg = ToolRegistry::new().with_activity_log(Arc::clone(&activity));
        reg.register(FailingTool);
        let err = reg.call_tool("flaky_run", &json!({}), Some("s1")).await.unwrap_err();
        assert!(matches!(err, ToolError::Execution(_)));

        let complete = activity
            .get_events(&EventFilter {
                event_type: Some(EventType::ToolExecutionComplete),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].data["success"], false);
        assert_eq!(complete[0].data["error"], "intentional failure");
    }

    struct CountingHook {
        pre: AtomicUsize,
        post: AtomicUsize,
        fail_pre: bool,
    }

    #[async_trait]
    impl SnapshotHook for CountingHook {
        async fn pre_tool(&self, _t: &str, _m: &str, _p: &Value) -> anyhow::Result<()> {
            self.pre.fetch_add(1, Ordering::Relaxed);
            if self.fail_pre {
                anyhow::bail!("pre snapshot failed")
            }
            Ok(())
        }
        async fn post_tool(
            &self,
            _t: &str,
            _m: &str,
            _r: Option<&Value>,
            _e: Option<&str>,
        ) -> anyhow::Result<()> {
            self.post.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[tokio::test]
    async fn snapshots_bracket_the_call() {
        let activity = Arc::new(ActivityLog::in_memory().unwrap());
        let hook = Arc::new(CountingHook {
            pre: AtomicUsize::new(0),
            post: AtomicUsize::new(0),
            fail_pre: false,
        });
        let mut reg = ToolRegistry::new()
            .with_activity_log(activity)
            .with_snapshot_hook(Arc::clone(&hook) as Arc<dyn SnapshotHook>, SnapshotConfig::default());
        reg.register(EchoTool);
        reg.call_tool_with_snapshots("echo_say", &json!({"text": "x"}), "s1", "0")
            .await
            .unwrap();
        assert_eq!(hook.pre.load(Ordering::Relaxed), 1);
        assert_eq!(hook.post.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn failing_pre_snapshot_does_not_fail_the_call() {
        let activity = Arc::new(ActivityLog::in_memory().unwrap());
        let hook = Arc::new(CountingHook {
            pre: AtomicUsize::new(0),
            post: AtomicUsize::new(0),
            fail_pre: true,
        });
        let mut reg = ToolRegistry::new()
            .with_activity_log(Arc::clone(&activity))
            .with_snapshot_hook(hook as Arc<dyn SnapshotHook>, SnapshotConfig::default());
        reg.register(EchoTool);
        let out = reg
            .call_tool_with_snapshots("echo_say", &json!({"text": "x"}), "s1", "0")
            .await
            .unwrap();
        assert_eq!(out["said"], "x");

        let snapshot_errors = activity
            .get_events(&EventFilter {
                event_type: Some(EventType::SnapshotError),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(snapshot_errors.len(), 1);
        assert_eq!(snapshot_errors[0].data["type"], "pre-tool");
    }

    #[tokio::test]
    async fn tool_failure_with_snapshots_still_propagates() {
        let activity = Arc::new(ActivityLog::in_memory().unwrap());
        let hook = Arc::new(CountingHook {
            pre: AtomicUsize::new(0),
            post: AtomicUsize::new(0),
            fail_pre: false,
        });
        let mut reg = ToolRegistry::new()
            .with_activity_log(Arc::clone(&activity))
            .with_snapshot_hook(Arc::clone(&hook) as Arc<dyn SnapshotHook>, SnapshotConfig::default());
        reg.register(FailingTool);
        let err = reg
            .call_tool_with_snapshots("flaky_run", &json!({}), "s1", "0")
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Execution(_)));
        // Post snapshot still ran (snapshot_on_errors default true).
        assert_eq!(hook.post.load(Ordering::Relaxed), 1);
        let complete = activity
            .get_events(&EventFilter {
                event_type: Some(EventType::ToolExecutionComplete),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(complete[0].data["success"], false);
    }

    #[test]
    fn method_specs_sorted_by_combined_name() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        reg.register(FailingTool);
        let names: Vec<String> =
            reg.method_specs().iter().map(|(t, m, _)| format!("{t}_{m}")).collect();
        assert_eq!(names, vec!["echo_say", "flaky_run"]);
    }
}
