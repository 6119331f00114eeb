// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Static role catalog consulted at agent construction and task analysis.

/// One agent role with its defaults.  Read-only after process start.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleDefinition {
    pub name: &'static str,
    pub default_provider: &'static str,
    pub default_model: &'static str,
    pub capabilities: &'static [&'static str],
    pub system_prompt: &'static str,
    /// Parallel-tool bound for one batch.
    pub max_concurrent_tools: usize,
    /// Context-window preference; the live model definition wins when smaller.
    pub max_context_size: usize,
    /// Fraction of the window that triggers handoff.
    pub handoff_threshold: f32,
    /// Tool names this role may not call.  Empty = unrestricted.
    pub tool_restrictions: &'static [&'static str],
}

const ROLES: &[RoleDefinition] = &[
    RoleDefinition {
        name: "general",
        default_provider: "openai",
        default_model: "gpt-4o",
        capabilities: &["tools", "delegation"],
        system_prompt: "You are a capable general-purpose assistant. Use the available tools \
                        when they help, and answer directly when they do not.",
        max_concurrent_tools: 8,
        max_context_size: 128_000,
        handoff_threshold: 0.8,
        tool_restrictions: &[],
    },
    RoleDefinition {
        name: "orchestrator",
        default_provider: "anthropic",
        default_model: "claude-opus-4-5",
        capabilities: &["tools", "delegation", "planning"],
        system_prompt: "You coordinate work on a user request. Break large tasks into focused \
                        subtasks and delegate them; synthesize the results into one answer.",
        max_concurrent_tools: 10,
        max_context_size: 200_000,
        handoff_threshold: 0.8,
        tool_restrictions: &[],
    },
    RoleDefinition {
        name: "planning",
        default_provider: "anthropic",
        default_model: "claude-sonnet-4-5",
        capabilities: &["tools"],
        system_prompt: "You produce plans and designs. Read and analyze as needed, but prefer \
                        a clear written plan over taking actions yourself.",
        max_concurrent_tools: 4,
        max_context_size: 200_000,
        handoff_threshold: 0.8,
        tool_restrictions: &[],
    },
    RoleDefinition {
        name: "reasoning",
        default_provider: "openai",
        default_model: "o3",
        capabilities: &["tools"],
        system_prompt: "You analyze problems and explain causes. Gather evidence with tools, \
                        then reason carefully to a conclusion.",
        max_concurrent_tools: 4,
        max_context_size: 128_000,
        handoff_threshold: 0.8,
        tool_restrictions: &[],
    },
    RoleDefinition {
        name: "execution",
        default_provider: "openai",
        default_model: "gpt-4o-mini",
        capabilities: &["tools"],
        system_prompt: "You carry out concrete operations: run commands, list and inspect \
                        resources, and report results precisely.",
        max_concurrent_tools: 3,
        max_context_size: 128_000,
        handoff_threshold: 0.8,
        tool_restrictions: &[],
    },
];

pub fn all_roles() -> &'static [RoleDefinition] {
    ROLES
}

pub fn lookup_role(name: &str) -> Option<&'static RoleDefinition> {
    ROLES.iter().find(|r| r.name == name)
}

/// Pick a role for a delegated task by keyword heuristic, checked in order:
/// planning, reasoning, execution, otherwise general.
pub fn choose_role_for_task(task: &str) -> &'static RoleDefinition {
    let lower = task.to_lowercase();
    let contains_any = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    let name = if contains_any(&["plan", "design", "architect"]) {
        "planning"
    } else if contains_any(&["analyze", "debug", "reason", "why", "explain"]) {
        "reasoning"
    } else if contains_any(&["run", "execute", "list", "show", "find"]) {
        "execution"
    } else {
        "general"
    };
    lookup_role(name).expect("built-in role table covers all heuristic outcomes")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_roles_exist() {
        for name in ["general", "orchestrator", "planning", "reasoning", "execution"] {
            assert!(lookup_role(name).is_some(), "missing role {name}");
        }
        assert!(lookup_role("poet").is_none());
    }

    #[test]
    fn concurrency_defaults_match_role_table() {
        assert_eq!(lookup_role("general").unwrap().max_concurrent_tools, 8);
        assert_eq!(lookup_role("orchestrator").unwrap().max_concurrent_tools, 10);
        assert_eq!(lookup_role("execution").unwrap().max_concurrent_tools, 3);
    }

    #[test]
    fn planning_keywords() {
        assert_eq!(choose_role_for_task("Plan the rollout").name, "planning");
        assert_eq!(choose_role_for_task("design a retry policy").name, "planning");
        assert_eq!(choose_role_for_task("architect the data layer").name, "planning");
    }

    #[test]
    fn reasoning_keywords() {
        assert_eq!(
            choose_role_for_task("analyze this bug and explain the root cause").name,
            "reasoning"
        );
        assert_eq!(choose_role_for_task("why does this fail?").name, "reasoning");
        assert_eq!(choose_role_for_task("debug the flaky test").name, "reasoning");
    }

    #[test]
    fn execution_keywords() {
        assert_eq!(choose_role_for_task("run the test suite").name, "execution");
        assert_eq!(choose_role_for_task("list open tickets").name, "execution");
        assert_eq!(choose_role_for_task("show me the config").name, "execution");
    }

    #[test]
    fn planning_wins_over_later_categories() {
        // "plan" and "run" both present; planning is checked first.
        assert_eq!(choose_role_for_task("plan how to run the migration").name, "planning");
    }

    #[test]
    fn fallback_is_general() {
        assert_eq!(choose_role_for_task("summarize this document").name, "general");
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(choose_role_for_task("ANALYZE the logs").name, "reasoning");
    }
}
