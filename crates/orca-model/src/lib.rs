// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod definition;
mod mock;
mod session;
mod types;

pub use definition::{CostBreakdown, ModelDefinition};
pub use mock::{MockSession, ScriptStep, ScriptedMockSession};
pub use session::{EventStream, ModelSession, TokenCount};
pub use types::*;
