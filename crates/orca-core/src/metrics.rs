// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use orca_model::Usage;

/// Per-agent running counters for one conversation.
///
/// Subagents start fresh; metrics are never inherited.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversationMetrics {
    pub total_messages: u64,
    pub total_tokens_used: u64,
    pub total_cache_hits: u64,
    pub total_cache_creations: u64,
}

impl ConversationMetrics {
    pub fn record_message(&mut self) {
        self.total_messages += 1;
    }

    pub fn record_usage(&mut self, usage: &Usage) {
        self.total_tokens_used += usage.total_tokens() as u64;
        self.total_cache_hits += usage.cache_read_tokens as u64;
        self.total_cache_creations += usage.cache_write_tokens as u64;
    }

    /// Cache hit rate formatted to one decimal, e.g. `"66.7%"`.
    /// `"0.0%"` when no cache activity has been observed.
    pub fn cache_hit_rate(&self) -> String {
        let denominator = self.total_cache_hits + self.total_cache_creations;
        if denominator == 0 {
            return "0.0%".to_string();
        }
        let rate = self.total_cache_hits as f64 / denominator as f64 * 100.0;
        format!("{rate:.1}%")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
