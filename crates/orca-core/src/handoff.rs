// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Deterministic context compression for agent handoff.
//!
//! When a conversation approaches the model's context window, the agent
//! compresses its history into a summary, records the handoff, and a fresh
//! successor agent continues from the summary instead of the raw history.
//! Compression here is deterministic (no model call), so handoff always
//! succeeds regardless of how large the session has grown.

use orca_store::{MessageKind, StoredMessage};

/// How many of the most recent user requests the summary lists verbatim.
const SUMMARY_USER_REQUESTS: usize = 5;
/// Per-excerpt cap inside the summary.
const EXCERPT_CHARS: usize = 400;

/// Compress stored history into a handoff summary bounded by `char_cap`.
pub fn compress_history(messages: &[StoredMessage], char_cap: usize) -> String {
    let mut out = String::with_capacity(char_cap.min(4096));
    out.push_str(
        "[Context handoff: this conversation was compressed. Earlier detail was dropped \
         to stay within the model context window.]\n",
    );

    let user_requests: Vec<&StoredMessage> =
        messages.iter().filter(|m| m.role == MessageKind::User).collect();
    if !user_requests.is_empty() {
        out.push_str("\n## Recent user requests\n");
        let start = user_requests.len().saturating_sub(SUMMARY_USER_REQUESTS);
        for m in &user_requests[start..] {
            out.push_str("- ");
            out.push_str(&truncate_head_tail(&m.content, EXCERPT_CHARS));
            out.push('\n');
        }
    }

    let tool_rounds = messages.iter().filter(|m| m.role == MessageKind::ToolResult).count();
    if tool_rounds > 0 {
        out.push_str(&format!("\n## Activity\n- {tool_rounds} tool result(s) were produced and consumed.\n"));
    }

    if let Some(last_assistant) =
        messages.iter().rev().find(|m| m.role == MessageKind::Assistant)
    {
        out.push_str("\n## Last assistant output\n");
        out.push_str(&truncate_head_tail(&last_assistant.content, EXCERPT_CHARS * 2));
        out.push('\n');
    }

    truncate_head_tail(&out, char_cap)
}

/// Keep the head and tail of oversized text with an elision marker.
///
/// Used both for handoff summaries and for tool results that exceed the
/// configured feedback cap: the start usually carries the setup and the end
/// the conclusion, so a middle cut loses the least.
pub fn truncate_head_tail(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let head_len = cap * 6 / 10;
    let tail_len = cap - head_len;
    let head_end = floor_char_boundary(text, head_len);
    let tail_start = floor_char_boundary(text, text.len() - tail_len.min(text.len()));
    let dropped = tail_start - head_end;
    format!(
        "{}\n[... {dropped} chars truncated ...]\n{}",
        &text[..head_end],
        &text[tail_start..]
    )
}

/// Largest index ≤ `i` that lies on a UTF-8 character boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    let mut i = i.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
