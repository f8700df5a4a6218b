// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Failure classification and provider cooldown tracking.
//!
//! Every provider error is classified into a [`FailureKind`] that drives the
//! router's retry / fallback / surface decision.  Classification inspects,
//! in order: an HTTP status embedded in the error text, error code strings
//! (`ETIMEDOUT`, `ECONNRESET`, ...), then textual patterns.
//!
//! Providers that misbehave at the account level (rate limit, auth, billing,
//! 5xx) enter a cooldown window during which the fallback traversal skips
//! them entirely — no HTTP attempt is made against a cool provider.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::info;

// ─── Cooldown defaults ────────────────────────────────────────────────────────

const RATE_LIMIT_COOLDOWN_SEC: u64 = 60;
const AUTH_COOLDOWN_SEC: u64 = 300;
const SERVER_COOLDOWN_SEC: u64 = 30;
const MAX_COOLDOWN_SEC: u64 = 600;

/// Classification of model-provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 429 — retry with backoff, cool the provider.
    RateLimit,
    /// 401/403 — cool the provider, try a fallback.
    AuthError,
    /// 402 / payment / quota — cool the provider, try a fallback.
    Billing,
    /// 408 / ETIMEDOUT / "timed out" — retry with backoff.
    Timeout,
    /// Input too long — bubbled to the agent loop for compaction.
    ContextOverflow,
    /// Content blocked — surfaced as the final response.
    ContentFilter,
    /// 5xx — retry with backoff, short cooldown.
    ServerError,
    /// 400 / schema / thought-signature errors — drop tail, retry once.
    FormatError,
    /// Connection / DNS failures — retry with backoff.
    NetworkError,
    /// Model not found / unavailable — try the next model in the chain.
    ModelError,
    Unknown,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::RateLimit => "rate_limit",
            FailureKind::AuthError => "auth_error",
            FailureKind::Billing => "billing",
            FailureKind::Timeout => "timeout",
            FailureKind::ContextOverflow => "context_overflow",
            FailureKind::ContentFilter => "content_filter",
            FailureKind::ServerError => "server_error",
            FailureKind::FormatError => "format_error",
            FailureKind::NetworkError => "network_error",
            FailureKind::ModelError => "model_error",
            FailureKind::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Marker error for a user-initiated abort.  Never retried; propagates
/// through the router untouched.
#[derive(Debug, thiserror::Error)]
#[error("aborted by user")]
pub struct Aborted;

/// Extract an HTTP status code from an error message.
///
/// Driver errors embed the status as `"<driver> error <status>: <body>"`;
/// reqwest errors mention `"status code"` in prose.  Any standalone 3-digit
/// number in the 400–599 range counts.
fn status_from_message(msg: &str) -> Option<u16> {
    let bytes = msg.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i - start == 3 {
                // Reject digits embedded in longer tokens (e.g. "sk-4045x").
                let left_ok = start == 0 || !bytes[start - 1].is_ascii_alphanumeric();
                let right_ok = i == bytes.len() || !bytes[i].is_ascii_alphanumeric();
                if left_ok && right_ok {
                    if let Ok(code) = msg[start..i].parse::<u16>() {
                        if (400..=599).contains(&code) {
                            return Some(code);
                        }
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    None
}

/// Classify an error to determine the retry strategy.
pub fn classify(err: &anyhow::Error) -> FailureKind {
    let msg = format!("{err:#}");
    let lower = msg.to_lowercase();

    // 1. HTTP status (strongest signal).
    if let Some(status) = status_from_message(&msg) {
        match status {
            402 => return FailureKind::Billing,
            429 => return FailureKind::RateLimit,
            401 | 403 => return FailureKind::AuthError,
            408 => return FailureKind::Timeout,
            400 => {
                // A 400 caused by an oversized prompt is a context problem,
                // not a request-format problem.
                if lower.contains("context length")
                    || lower.contains("too long")
                    || lower.contains("max_tokens")
                    || lower.contains("maximum context")
                {
                    return FailureKind::ContextOverflow;
                }
                return FailureKind::FormatError;
            }
            500..=599 => return FailureKind::ServerError,
            _ => {}
        }
    }

    // 2. Error code strings.
    if lower.contains("etimedout")
        || lower.contains("esockettimedout")
        || lower.contains("deadline exceeded")
        || lower.contains("timed out")
        || lower.contains("timeout")
    {
        return FailureKind::Timeout;
    }
    if lower.contains("econnreset") || lower.contains("econnaborted") {
        return FailureKind::NetworkError;
    }

    // 3. Textual patterns.
    if lower.contains("rate limit") || lower.contains("too many requests") {
        return FailureKind::RateLimit;
    }
    if lower.contains("unauthorized") || lower.contains("forbidden") {
        return FailureKind::AuthError;
    }
    if lower.contains("billing") || lower.contains("payment") || lower.contains("quota") {
        return FailureKind::Billing;
    }
    if lower.contains("context length")
        || lower.contains("too long")
        || lower.contains("max_tokens")
        || lower.contains("maximum context")
    {
        return FailureKind::ContextOverflow;
    }
    if lower.contains("content filter")
        || lower.contains("content_filter")
        || lower.contains("blocked")
    {
        return FailureKind::ContentFilter;
    }
    if lower.contains("thought_signature") || lower.contains("invalid schema") {
        return FailureKind::FormatError;
    }
    if lower.contains("model")
        && (lower.contains("not found") || lower.contains("invalid") || lower.contains("unavailable"))
    {
        return FailureKind::ModelError;
    }
    if lower.contains("connection") || lower.contains("network") || lower.contains("dns") {
        return FailureKind::NetworkError;
    }

    FailureKind::Unknown
}

/// Whether the same call may be retried (after backoff).
pub fn is_retryable(kind: FailureKind) -> bool {
    matches!(
        kind,
        FailureKind::RateLimit
            | FailureKind::Timeout
            | FailureKind::ServerError
            | FailureKind::NetworkError
            | FailureKind::ModelError
    )
}

/// Whether the failure indicts the provider (→ cooldown + fallback) rather
/// than this particular request.
pub fn is_provider_level(kind: FailureKind) -> bool {
    matches!(
        kind,
        FailureKind::RateLimit
            | FailureKind::AuthError
            | FailureKind::Billing
            | FailureKind::ServerError
    )
}

fn cooldown_duration(kind: FailureKind) -> Option<Duration> {
    let secs = match kind {
        FailureKind::RateLimit => RATE_LIMIT_COOLDOWN_SEC,
        FailureKind::AuthError | FailureKind::Billing => AUTH_COOLDOWN_SEC,
        FailureKind::ServerError => SERVER_COOLDOWN_SEC,
        _ => return None,
    };
    Some(Duration::from_secs(secs.min(MAX_COOLDOWN_SEC)))
}

/// Record of a single model attempt, kept for the aggregated failure result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelAttempt {
    pub provider: String,
    pub model: String,
    pub error: String,
    pub kind: FailureKind,
    pub duration_ms: u64,
}

/// Thread-safe in-memory provider cooldown table.
///
/// Cooldowns are only ever extended, never shortened, and are cleared on the
/// next successful request.  State resets on restart.
#[derive(Default)]
pub struct CooldownTracker {
    // provider → (cool until, reason)
    cooldowns: Mutex<HashMap<String, (Instant, String)>>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a provider into cooldown after a provider-level failure.
    pub fn enter(&self, provider: &str, kind: FailureKind, model: &str) {
        let Some(duration) = cooldown_duration(kind) else {
            return;
        };
        let until = Instant::now() + duration;
        let reason = if model.is_empty() {
            kind.to_string()
        } else {
            format!("{kind} on {model}")
        };
        let mut map = self.cooldowns.lock().unwrap_or_else(|p| p.into_inner());
        let extend = map.get(provider).map(|(u, _)| until > *u).unwrap_or(true);
        if extend {
            info!(provider, %kind, secs = duration.as_secs(), "provider entering cooldown");
            map.insert(provider.to_string(), (until, reason));
        }
    }

    /// Whether a provider is currently cool.  Expired entries are evicted.
    pub fn is_cool(&self, provider: &str) -> bool {
        let mut map = self.cooldowns.lock().unwrap_or_else(|p| p.into_inner());
        match map.get(provider) {
            Some((until, _)) if Instant::now() >= *until => {
                map.remove(provider);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Clear a provider's cooldown (on success).
    pub fn clear(&self, provider: &str) {
        let mut map = self.cooldowns.lock().unwrap_or_else(|p| p.into_inner());
        map.remove(provider);
    }

    /// Remaining cooldown and reason, for status output.
    pub fn info(&self, provider: &str) -> Option<(Duration, String)> {
        let mut map = self.cooldowns.lock().unwrap_or_else(|p| p.into_inner());
        match map.get(provider) {
            Some((until, reason)) => {
                let now = Instant::now();
                if now >= *until {
                    map.remove(provider);
                    None
                } else {
                    Some((*until - now, reason.clone()))
                }
            }
            None => None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
