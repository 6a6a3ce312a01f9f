// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

use colloquy_model::ToolResult;

const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;

/// Trait that every built-in and server-side tool must implement.
///
/// Execution failures are data, not errors: wrap them in
/// [`ToolResult::failure`] so the turn continues and the model can recover.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the arguments object.
    fn parameters_schema(&self) -> Value;
    /// Wall-clock budget for one execution.  The dispatcher enforces this.
    fn timeout_secs(&self) -> u64 {
        DEFAULT_TOOL_TIMEOUT_SECS
    }
    /// System tools are engine built-ins available to every agent regardless
    /// of its configured tool list.
    fn is_system(&self) -> bool {
        false
    }
    async fn execute(&self, arguments: &Value) -> ToolResult;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
