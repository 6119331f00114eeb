// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use regex::Regex;

use crate::tool::ToolCall;

/// One authorization request, carrying the call and optional caller context.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub call: ToolCall,
    pub context: Option<String>,
}

impl ApprovalRequest {
    pub fn for_call(call: ToolCall) -> Self {
        Self { call, context: None }
    }
}

/// The policy's answer.  A `modified_call` replaces the original call when
/// the policy rewrites arguments (e.g. narrowing a path).
#[derive(Debug, Clone)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub reason: Option<String>,
    pub modified_call: Option<ToolCall>,
}

impl ApprovalDecision {
    pub fn approve() -> Self {
        Self { approved: true, reason: None, modified_call: None }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self { approved: false, reason: Some(reason.into()), modified_call: None }
    }
}

/// Per-call authorization decision from a configurable policy.
///
/// Interactive prompting lives outside the engine; the engine only consumes
/// decisions.
#[async_trait]
pub trait ApprovalEngine: Send + Sync {
    async fn request_approval(&self, req: &ApprovalRequest) -> ApprovalDecision;
}

/// Approves everything.  The default for tests and trusted environments.
pub struct AllowAllApprovals;

#[async_trait]
impl ApprovalEngine for AllowAllApprovals {
    async fn request_approval(&self, _req: &ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::approve()
    }
}

/// Pattern policy: a deny list and an auto-approve list of glob patterns
/// matched against the canonical tool-call name.  Deny wins over auto.
/// Unmatched calls fall back to `default_approve`.
pub struct PatternApprovalEngine {
    auto_patterns: Vec<Regex>,
    deny_patterns: Vec<Regex>,
    default_approve: bool,
}

impl PatternApprovalEngine {
    pub fn new(auto: &[String], deny: &[String], default_approve: bool) -> Self {
        Self {
            auto_patterns: auto.iter().filter_map(|p| Self::compile_pattern(p)).collect(),
            deny_patterns: deny.iter().filter_map(|p| Self::compile_pattern(p)).collect(),
            default_approve,
        }
    }

    /// Compile one policy pattern into an anchored regex.
    ///
    /// Patterns use shell glob syntax over canonical tool-call names: `*`
    /// matches any run of characters, `?` matches exactly one; everything
    /// else is literal.  A pattern that still fails to compile is dropped,
    /// so one bad entry cannot disable the rest of the policy.
    fn compile_pattern(pattern: &str) -> Option<Regex> {
        let mut anchored = String::with_capacity(pattern.len() + 8);
        anchored.push('^');
        let mut literal = String::new();
        for ch in pattern.chars() {
            match ch {
                '*' | '?' => {
                    if !literal.is_empty() {
                        anchored.push_str(&regex::escape(&literal));
                        literal.clear();
                    }
                    anchored.push_str(if ch == '*' { ".*" } else { "." });
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            anchored.push_str(&regex::escape(&literal));
        }
        anchored.push('$');
        Regex::new(&anchored).ok()
    }
}

#[async_trait]
impl ApprovalEngine for PatternApprovalEngine {
    async fn request_approval(&self, req: &ApprovalRequest) -> ApprovalDecision {
        let name = &req.call.name;
        for re in &self.deny_patterns {
            if re.is_match(name) {
                return ApprovalDecision::deny(format!("tool '{name}' is deny-listed"));
            }
        }
        for re in &self.auto_patterns {
            if re.is_match(name) {
                return ApprovalDecision::approve();
            }
        }
        if self.default_approve {
            ApprovalDecision::approve()
        } else {
            ApprovalDecision::deny(format!("tool '{name}' is not on the auto-approve list"))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
