// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

use colloquy_model::BackendError;

use crate::conversation::StateError;
use crate::prompt::PromptError;

/// Engine-level error taxonomy.
///
/// Propagation policy: errors local to one tool become failed ToolResults and
/// never surface here; errors spanning the turn fail the turn; event-emission
/// errors are logged and swallowed by the broadcaster.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input at the boundary.  Rejected without state change.
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error("max turns exceeded")]
    MaxTurns,
    #[error("internal error: {0}")]
    Internal(String),
}
