// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use orca_config::BreakerConfig;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of a pre-dispatch check.
#[derive(Debug, Clone, Copy)]
pub struct BreakerCheck {
    /// When true the call must be short-circuited with `circuit_open`.
    pub blocked: bool,
    /// True for probe calls admitted right after the open timeout elapsed.
    pub recovered: bool,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    half_open_calls: u32,
}

/// Per-tool-name failure tracker.
///
/// Batch members within one agent share an entry and update it through the
/// internal mutex; the lock is held only for the state transition, never
/// across an await.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure_at: None,
                opened_at: None,
                half_open_calls: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    pub fn failures(&self) -> u32 {
        self.inner.lock().unwrap().failures
    }

    /// Consult the breaker before dispatching a call.
    pub fn check(&self) -> BreakerCheck {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => BreakerCheck { blocked: false, recovered: false },
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= Duration::from_millis(self.config.open_timeout_ms) {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_calls = 1;
                    BreakerCheck { blocked: false, recovered: true }
                } else {
                    BreakerCheck { blocked: true, recovered: false }
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    BreakerCheck { blocked: false, recovered: true }
                } else {
                    BreakerCheck { blocked: true, recovered: false }
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Closed;
            inner.failures = 0;
            inner.half_open_calls = 0;
            inner.opened_at = None;
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failures += 1;
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                if inner.failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                // Probe failed: back to open with a fresh timeout.
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_calls = 0;
            }
            BreakerState::Open => {}
        }
    }
}

/// Lazily-populated map of breakers, one per tool name.
///
/// Each agent owns its own map, so circuit state never crosses agents.
#[derive(Debug)]
pub struct BreakerMap {
    config: BreakerConfig,
    entries: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerMap {
    pub fn new(config: BreakerConfig) -> Self {
        Self { config, entries: Mutex::new(HashMap::new()) }
    }

    /// The breaker for `tool_name`, created on first observation.
    pub fn breaker_for(&self, tool_name: &str) -> Arc<CircuitBreaker> {
        let mut entries = self.entries.lock().unwrap();
        Arc::clone(
            entries
                .entry(tool_name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone()))),
        )
    }

    /// Names with an existing entry (observed at least once).
    pub fn known_tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
