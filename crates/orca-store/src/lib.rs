// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Dual persistence for the orchestration engine.
//!
//! [`ActivityLog`] is the append-only observability event sink;
//! [`ConversationStore`] is the per-session dialogue transcript.  The two
//! are written independently; a failure in one never breaks the other.

mod activity;
mod conversation;
mod event;

pub use activity::{ActivityLog, EventFilter};
pub use conversation::{
    ConversationStore, HandoffRecord, MessageKind, NewMessage, StoredMessage, UsageRecord,
};
pub use event::{ActivityEvent, EventPayload, EventType, SnapshotPhase};
