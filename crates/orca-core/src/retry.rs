// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use orca_config::RetryConfig;

/// Error classification by case-insensitive substring match, checked in the
/// order the variants are listed below.  The first matching category wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Provider rate limiting; suggested wait 60 s.
    RateLimit,
    /// Provider overload / capacity; suggested wait 10 s.
    Overload,
    /// Network transport trouble; suggested wait 5 s.
    Network,
    /// Authentication, permission, or invalid-input failures; never retried.
    NonRetriable,
    /// Anything else; retried with the default backoff schedule.
    Unknown,
}

impl ErrorCategory {
    /// The provider's suggested wait for this category.  Informational
    /// metadata surfaced in logs; the backoff timer is a function of the
    /// attempt number alone (see [`RetryPolicy::delay`]).
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimit => Some(60_000),
            Self::Overload => Some(10_000),
            Self::Network => Some(5_000),
            Self::NonRetriable | Self::Unknown => None,
        }
    }

    pub fn is_retriable(&self) -> bool {
        !matches!(self, Self::NonRetriable)
    }
}

const RATE_LIMIT_HINTS: &[&str] = &["rate limit", "rate_limit", "too many requests", "429"];
const OVERLOAD_HINTS: &[&str] = &["overload", "capacity", "503", "service unavailable"];
const NETWORK_HINTS: &[&str] =
    &["network", "timeout", "timed out", "connection", "socket", "dns", "econn"];
// The last group includes the engine's own non-retriable tool failures
// (validation and resolution errors), which reach the retry loop as plain
// messages like any provider error.
const NON_RETRIABLE_HINTS: &[&str] = &[
    "authentication",
    "unauthorized",
    "api key",
    "permission",
    "forbidden",
    "invalid input",
    "invalid parameters",
    "unknown tool",
    "has no method",
    "401",
    "403",
];

/// Classify an error message.  Checks are ordered: rate limit, overload,
/// network, non-retriable, unknown.
pub fn categorize(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    let matches = |hints: &[&str]| hints.iter().any(|h| lower.contains(h));
    if matches(RATE_LIMIT_HINTS) {
        ErrorCategory::RateLimit
    } else if matches(OVERLOAD_HINTS) {
        ErrorCategory::Overload
    } else if matches(NETWORK_HINTS) {
        ErrorCategory::Network
    } else if matches(NON_RETRIABLE_HINTS) {
        ErrorCategory::NonRetriable
    } else {
        ErrorCategory::Unknown
    }
}

/// Exponential backoff with additive jitter, applied per call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Delay before retrying after `attempt` failures (0-based):
    /// `min(max_delay, base * multiplier^attempt) * (1 + random[0, 0.1])`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay_ms as f64
            * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.config.max_delay_ms as f64);
        let jitter = 1.0 + rand::random::<f64>() * 0.1;
        Duration::from_millis((capped * jitter) as u64)
    }

    /// Run `op`, retrying retriable failures until the per-call budget is
    /// exhausted.  Backoff sleeps abort early on cancellation, returning the
    /// last error.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let category = categorize(&format!("{e:#}"));
                    if !category.is_retriable() || attempt >= self.config.max_retries {
                        return Err(e);
                    }
                    let delay = self.delay(attempt);
                    warn!(
                        attempt,
                        ?category,
                        retry_after_hint_ms = ?category.retry_after_ms(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retriable failure; backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
