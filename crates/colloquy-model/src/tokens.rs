// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Content-aware token estimation.
//!
//! Estimates are intentionally conservative (they over-count rather than
//! under-count) so that budget math built on them never overflows a real
//! context window.  Providers tokenize structured text more densely than
//! prose, so the chars-per-token divisor depends on what the text looks like.

/// Rough shape of a piece of text, used to pick the chars-per-token divisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentShape {
    /// JSON-ish payloads: 2.5 chars per token.
    Json,
    /// Source code / markup: 3.0 chars per token.
    Code,
    /// Plain prose: 4.0 chars per token.
    Prose,
}

impl ContentShape {
    fn chars_per_token(self) -> f32 {
        match self {
            ContentShape::Json => 2.5,
            ContentShape::Code => 3.0,
            ContentShape::Prose => 4.0,
        }
    }
}

/// Classify text by its dominant shape.
pub fn classify(text: &str) -> ContentShape {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return ContentShape::Json;
    }
    if trimmed.contains("```")
        || trimmed.contains("fn ")
        || trimmed.contains("def ")
        || trimmed.contains(";\n")
        || trimmed.contains("</")
    {
        return ContentShape::Code;
    }
    ContentShape::Prose
}

/// Estimate the token count of `text`.  Never returns 0 for non-empty input.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let divisor = classify(text).chars_per_token();
    ((text.len() as f32 / divisor).ceil() as usize).max(1)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
