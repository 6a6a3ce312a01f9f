// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in a conversation transcript.
///
/// The role tag selects the variant, so every message serializes through one
/// schema: `{"role": "...", ...fields}`.  `to_wire`/`from_wire` round-trip
/// losslessly for every role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
        /// Base64 data URLs attached to this turn.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<String>,
    },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
        /// Provider-visible reasoning scratchpad.  Never merged into `content`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking: Option<String>,
    },
    Tool {
        #[serde(rename = "tool_call_id")]
        call_id: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::System { content: text.into() }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::User { content: text.into(), images: Vec::new() }
    }

    pub fn user_with_images(text: impl Into<String>, images: Vec<String>) -> Self {
        Self::User { content: text.into(), images }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            content: text.into(),
            tool_calls: Vec::new(),
            thinking: None,
        }
    }

    pub fn assistant_with_tools(
        text: impl Into<String>,
        tool_calls: Vec<ToolCall>,
        thinking: Option<String>,
    ) -> Self {
        Self::Assistant {
            content: text.into(),
            tool_calls,
            thinking,
        }
    }

    /// A tool message carrying the textual rendering of a [`ToolResult`].
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Tool {
            call_id: call_id.into(),
            content: content.into(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::System { .. } => Role::System,
            Self::User { .. } => Role::User,
            Self::Assistant { .. } => Role::Assistant,
            Self::Tool { .. } => Role::Tool,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::System { content }
            | Self::User { content, .. }
            | Self::Assistant { content, .. }
            | Self::Tool { content, .. } => content,
        }
    }

    /// Tool calls requested by an assistant message; empty for other roles.
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Self::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    /// The `tool_call_id` a tool message answers, if this is a tool message.
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            Self::Tool { call_id, .. } => Some(call_id),
            _ => None,
        }
    }

    pub fn to_wire(&self) -> Value {
        serde_json::to_value(self).expect("ChatMessage serialization is infallible")
    }

    pub fn from_wire(v: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(v)
    }
}

// ─── Tool types ───────────────────────────────────────────────────────────────

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-generated id, or `call_<n>` synthesized in turn-local order
    /// for providers that do not emit ids.
    pub id: String,
    pub name: String,
    /// JSON argument object.
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// The outcome of executing one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The textual form stored as the corresponding tool message's content.
    pub fn render(&self) -> String {
        if self.success {
            self.output.clone()
        } else {
            format!(
                "error: {}",
                self.error.as_deref().unwrap_or("tool execution failed")
            )
        }
    }
}

/// A tool schema offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
}

// ─── Request / response types ─────────────────────────────────────────────────

/// Request sent to a backend driver.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// System prompt, kept out of `messages` because several providers want
    /// it as a dedicated top-level field.
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
}

/// Which streaming channel a text delta belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Content,
    Thinking,
}

impl ChunkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkKind::Content => "content",
            ChunkKind::Thinking => "thinking",
        }
    }
}

/// A single low-level event streamed from a driver.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    TextDelta(String),
    ThinkingDelta(String),
    /// A tool-call fragment.  Providers may split one call across many events
    /// keyed by `index`; `arguments` fragments are concatenated in order.
    ToolCall {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    Usage {
        input_tokens: u32,
        output_tokens: u32,
    },
    /// The model hit its output-token limit; the turn finishes as `Length`.
    MaxTokens,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Fully assembled model response for one turn.
#[derive(Debug, Clone)]
pub struct AiResponse {
    pub content: String,
    pub model: String,
    pub tokens_used: TokenUsage,
    pub finish_reason: FinishReason,
    pub tool_calls: Vec<ToolCall>,
    pub thinking: Option<String>,
    pub metadata: serde_json::Map<String, Value>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
