// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use crate::roles::RoleDefinition;

/// Assemble the system prompt for one agent from its role, task, and the
/// tools it can reach.
///
/// The tool summary is a pre-formatted listing (one line per tool) produced
/// by the executor; keeping it out of this module avoids a dependency on the
/// registry here.
pub fn system_prompt(
    role: &RoleDefinition,
    task: Option<&str>,
    capabilities: &[String],
    model_name: &str,
    tool_summary: &str,
) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(role.system_prompt);
    prompt.push_str("\n\n## Operating context\n");
    prompt.push_str(&format!("- Role: {}\n- Model: {}\n", role.name, model_name));
    if !capabilities.is_empty() {
        prompt.push_str(&format!("- Capabilities: {}\n", capabilities.join(", ")));
    }
    if let Some(task) = task {
        prompt.push_str("\n## Assigned task\n");
        prompt.push_str(task);
        prompt.push('\n');
    }
    if !tool_summary.is_empty() {
        prompt.push_str("\n## Available tools\n");
        prompt.push_str(tool_summary);
        prompt.push_str(
            "\nCall tools through the structured tool-call protocol; never describe a call in \
             prose instead of making it.\n",
        );
    }
    prompt
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
