// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model metadata: context window, pricing, and capability flags.

use serde::{Deserialize, Serialize};

/// Read-only metadata for one model, exposed by its [`crate::ModelSession`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDefinition {
    /// Provider-scoped model identifier (e.g. "gpt-4o")
    pub name: String,
    /// Provider identifier: "openai" | "anthropic" | "mock" | …
    pub provider: String,
    /// Total context window in tokens (input + output)
    pub context_window: u32,
    /// Maximum output tokens per completion
    pub max_output_tokens: u32,
    /// Cost per million input tokens
    pub input_price: f64,
    /// Cost per million output tokens
    pub output_price: f64,
    /// Capability tags ("tools", "vision", "caching", …)
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl ModelDefinition {
    /// A definition suitable for tests and scripted mocks.
    pub fn mock() -> Self {
        Self {
            name: "mock-model".into(),
            provider: "mock".into(),
            context_window: 128_000,
            max_output_tokens: 4_096,
            input_price: 3.0,
            output_price: 15.0,
            capabilities: vec!["tools".into()],
        }
    }

    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Compute the cost of a turn from token counts.
    ///
    /// Prices are per million tokens; no rounding is applied; presentation
    /// layers format as needed.
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> CostBreakdown {
        let input_cost = (input_tokens as f64 / 1_000_000.0) * self.input_price;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * self.output_price;
        CostBreakdown { input_cost, output_cost, total_cost: input_cost + output_cost }
    }
}

/// Cost of a single model turn, split by direction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
