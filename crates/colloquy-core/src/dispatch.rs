// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool dispatch: routing a model-issued tool call to server-side execution
//! or client suspension, and executing server-side calls under their
//! per-tool timeouts.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use colloquy_model::{ToolCall, ToolResult, ToolSchema};
use colloquy_tools::ToolRegistry;

use crate::agent::AgentProfile;
use crate::conversation::Conversation;

/// Where a tool call executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolRoute {
    /// Executed by the connected client; suspends the conversation.
    Client,
    /// Engine built-in, available to every agent.
    System,
    /// Agent-registered server tool.
    Server,
}

impl ToolRoute {
    /// Server and system calls run synchronously inside the turn.
    pub fn is_server_side(self) -> bool {
        matches!(self, Self::Server | Self::System)
    }
}

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    /// Token cap applied to tool output before it enters the transcript.
    /// 0 disables capping.
    output_token_cap: usize,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, output_token_cap: usize) -> Self {
        Self {
            registry,
            output_token_cap,
        }
    }

    /// Classify a call.  A name the client declared always wins, even when a
    /// server tool of the same name exists.
    pub fn classify(&self, conversation: &Conversation, call: &ToolCall) -> ToolRoute {
        if conversation
            .client_tool_schemas
            .iter()
            .any(|s| s.name == call.name)
        {
            return ToolRoute::Client;
        }
        if self.registry.is_system(&call.name) {
            return ToolRoute::System;
        }
        ToolRoute::Server
    }

    /// The schemas offered to the model for this turn: the agent's server
    /// tools, every system tool, and the client-declared schemas.  Client
    /// declarations shadow server tools by name.
    pub fn schemas_for(&self, profile: &AgentProfile, conversation: &Conversation) -> Vec<ToolSchema> {
        let client_names: Vec<&str> = conversation
            .client_tool_schemas
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        let mut schemas: Vec<ToolSchema> = self
            .registry
            .schemas()
            .into_iter()
            .filter(|s| {
                !client_names.contains(&s.name.as_str())
                    && (self.registry.is_system(&s.name) || profile.tools.contains(&s.name))
            })
            .collect();
        schemas.extend(conversation.client_tool_schemas.iter().cloned());
        schemas
    }

    /// Execute a server-side call.  Timeouts, panics, and unknown names all
    /// become failed ToolResults — never turn-level errors.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let Some(tool) = self.registry.get(&call.name) else {
            warn!(tool = %call.name, "model called an unknown tool");
            return self.cap(ToolResult::failure(format!("unknown tool: {}", call.name)));
        };
        debug!(tool = %call.name, call_id = %call.id, "executing server tool");

        let timeout = Duration::from_secs(tool.timeout_secs());
        let arguments = call.arguments.clone();
        // Spawned so a panicking tool is isolated from the turn.
        let task = tokio::spawn(async move { tool.execute(&arguments).await });
        let result = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                warn!(tool = %call.name, error = %join_err, "tool execution panicked");
                ToolResult::failure(format!("tool panicked: {join_err}"))
            }
            Err(_) => ToolResult::failure(format!(
                "tool timed out after {}s",
                timeout.as_secs()
            )),
        };
        self.cap(result)
    }

    /// Truncate oversized output at a line boundary with an explicit notice.
    fn cap(&self, mut result: ToolResult) -> ToolResult {
        if self.output_token_cap == 0 {
            return result;
        }
        let cap_chars = self.output_token_cap * 4;
        if result.output.len() <= cap_chars {
            return result;
        }
        let omitted = result.output.len() - cap_chars;
        let cut = result.output[..cap_chars]
            .rfind('\n')
            .map(|p| p + 1)
            .unwrap_or_else(|| floor_char_boundary(&result.output, cap_chars));
        result.output.truncate(cut);
        result
            .output
            .push_str(&format!("\n[... {omitted} bytes omitted; output truncated ...]"));
        result
    }
}

fn floor_char_boundary(text: &str, mut i: usize) -> usize {
    while i > 0 && !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use colloquy_tools::Tool;

    use super::*;

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps forever"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn timeout_secs(&self) -> u64 {
            1
        }
        async fn execute(&self, _arguments: &Value) -> ToolResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ToolResult::success("never")
        }
    }

    struct BigOutputTool;

    #[async_trait]
    impl Tool for BigOutputTool {
        fn name(&self) -> &str {
            "big"
        }
        fn description(&self) -> &str {
            "produces a lot of output"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, _arguments: &Value) -> ToolResult {
            ToolResult::success("line\n".repeat(10_000))
        }
    }

    fn dispatcher_with(tool: impl Tool + 'static, cap: usize) -> ToolDispatcher {
        let mut registry = ToolRegistry::new();
        registry.register(tool);
        ToolDispatcher::new(Arc::new(registry), cap)
    }

    fn conversation_with_client_tool(name: &str) -> Conversation {
        Conversation::new(
            "a1",
            None,
            vec![ToolSchema {
                name: name.into(),
                description: "client side".into(),
                parameters: json!({ "type": "object" }),
            }],
        )
    }

    // ── Classification ────────────────────────────────────────────────────────

    #[test]
    fn client_declared_name_routes_to_client() {
        let d = dispatcher_with(BigOutputTool, 0);
        let conv = conversation_with_client_tool("bash");
        let call = ToolCall::new("call_0", "bash", json!({}));
        assert_eq!(d.classify(&conv, &call), ToolRoute::Client);
    }

    #[test]
    fn client_wins_over_server_tool_of_same_name() {
        let d = dispatcher_with(BigOutputTool, 0);
        let conv = conversation_with_client_tool("big");
        let call = ToolCall::new("call_0", "big", json!({}));
        assert_eq!(d.classify(&conv, &call), ToolRoute::Client);
    }

    #[test]
    fn registered_tool_routes_to_server() {
        let d = dispatcher_with(BigOutputTool, 0);
        let conv = Conversation::new("a1", None, vec![]);
        let call = ToolCall::new("call_0", "big", json!({}));
        assert_eq!(d.classify(&conv, &call), ToolRoute::Server);
        assert!(d.classify(&conv, &call).is_server_side());
    }

    #[test]
    fn builtin_task_list_routes_to_system() {
        let d = ToolDispatcher::new(Arc::new(ToolRegistry::default()), 0);
        let conv = Conversation::new("a1", None, vec![]);
        let call = ToolCall::new("call_0", "task_list", json!({}));
        assert_eq!(d.classify(&conv, &call), ToolRoute::System);
    }

    // ── Execution ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn unknown_tool_returns_failed_result() {
        let d = ToolDispatcher::new(Arc::new(ToolRegistry::new()), 0);
        let r = d.execute(&ToolCall::new("call_0", "ghost", json!({}))).await;
        assert!(!r.success);
        assert!(r.error.as_deref().unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn tool_timeout_becomes_failed_result() {
        let d = dispatcher_with(SlowTool, 0);
        let r = d.execute(&ToolCall::new("call_0", "slow", json!({}))).await;
        assert!(!r.success);
        assert!(r.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn oversized_output_truncated_with_notice() {
        let d = dispatcher_with(BigOutputTool, 100);
        let r = d.execute(&ToolCall::new("call_0", "big", json!({}))).await;
        assert!(r.success);
        assert!(r.output.len() < 1000);
        assert!(r.output.contains("omitted"));
        // Cut lands on a line boundary.
        assert!(r.output.contains("line\n"));
    }

    #[tokio::test]
    async fn zero_cap_disables_truncation() {
        let d = dispatcher_with(BigOutputTool, 0);
        let r = d.execute(&ToolCall::new("call_0", "big", json!({}))).await;
        assert_eq!(r.output.len(), 50_000);
    }

    // ── Schema selection ──────────────────────────────────────────────────────

    #[test]
    fn schemas_include_agent_tools_system_tools_and_client_tools() {
        let d = ToolDispatcher::new(Arc::new(ToolRegistry::default()), 0);
        let mut profile = AgentProfile::new("a1", "helper", "fake");
        profile.tools.push("web_search".into());
        let conv = conversation_with_client_tool("bash");
        let names: Vec<String> = d
            .schemas_for(&profile, &conv)
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert!(names.contains(&"web_search".to_string()), "agent tool");
        assert!(names.contains(&"task_list".to_string()), "system tool");
        assert!(names.contains(&"bash".to_string()), "client tool");
        assert!(
            !names.contains(&"web_fetch".to_string()),
            "tools the agent did not enable are excluded"
        );
    }

    #[test]
    fn client_declaration_shadows_server_schema() {
        let d = ToolDispatcher::new(Arc::new(ToolRegistry::default()), 0);
        let mut profile = AgentProfile::new("a1", "helper", "fake");
        profile.tools.push("web_search".into());
        let conv = conversation_with_client_tool("web_search");
        let schemas = d.schemas_for(&profile, &conv);
        let matches: Vec<&ToolSchema> =
            schemas.iter().filter(|s| s.name == "web_search").collect();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].description, "client side");
    }
}
