// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Failures a backend driver can surface.
///
/// `Unavailable` and `Timeout` are retryable at the caller's discretion, but
/// the turn processor never retries a model call — a turn has one try.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("request timed out after {0}s")]
    Timeout(u64),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("context window exceeded: {0}")]
    ContextOverflow(String),
    #[error("unknown backend driver: {0}")]
    UnknownDriver(String),
}

impl BackendError {
    /// Whether the caller could safely retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }

    /// Map a non-success HTTP response to the failure taxonomy.
    pub fn from_status(driver: &str, status: u16, body: &str) -> Self {
        let msg = format!("{driver} error {status}: {body}");
        match status {
            404 => Self::ModelNotFound(msg),
            429 => Self::RateLimited(msg),
            400..=499 if looks_like_context_overflow(body) => Self::ContextOverflow(msg),
            400..=499 => Self::Protocol(msg),
            _ => Self::Unavailable(msg),
        }
    }

    /// Map a transport error from `reqwest` to the failure taxonomy.
    pub fn from_transport(driver: &str, err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout_secs)
        } else if err.is_connect() {
            Self::Unavailable(format!("{driver}: {err}"))
        } else {
            Self::Protocol(format!("{driver}: {err}"))
        }
    }
}

/// Providers phrase context overflows differently; match the common markers.
fn looks_like_context_overflow(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("context length")
        || lower.contains("context window")
        || lower.contains("maximum context")
        || lower.contains("exceed_context_size")
        || lower.contains("prompt is too long")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
