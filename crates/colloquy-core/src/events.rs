// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::{json, Value};

use colloquy_model::{ChatMessage, ChunkKind, ToolCall};

use crate::conversation::{ConversationStats, PendingToolRequest};

/// Events pushed to a conversation's durable queue and streamed to clients.
///
/// Terminal kinds (`completed`, `failed`, `cancelled`) and `tool_request`
/// instruct the streaming endpoint to close after delivery.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    /// Emitted only by the streaming endpoint on connect, never persisted.
    Connected {
        conversation_id: String,
        status: &'static str,
    },
    TextChunk {
        conversation_id: String,
        chunk: String,
        kind: ChunkKind,
    },
    ToolRequest {
        conversation_id: String,
        request: PendingToolRequest,
        stats: ConversationStats,
    },
    ToolExecuting {
        conversation_id: String,
        call: ToolCall,
    },
    ToolCompleted {
        conversation_id: String,
        call_id: String,
        name: String,
        success: bool,
        content: String,
    },
    Completed {
        conversation_id: String,
        stats: ConversationStats,
        last_assistant: Option<ChatMessage>,
    },
    Failed {
        conversation_id: String,
        error: String,
        stats: ConversationStats,
    },
    Cancelled {
        conversation_id: String,
        stats: ConversationStats,
    },
    /// Non-fatal warning surfaced to subscribers (dropped model parameters,
    /// internal faults).  Never closes the stream.
    Error {
        conversation_id: String,
        error: String,
    },
    /// Keep-alive; carries no data and is ignored by clients.
    Heartbeat,
}

impl ConversationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::TextChunk { .. } => "text_chunk",
            Self::ToolRequest { .. } => "tool_request",
            Self::ToolExecuting { .. } => "tool_executing",
            Self::ToolCompleted { .. } => "tool_completed",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
            Self::Error { .. } => "error",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Terminal events end the conversation; nothing but heartbeats may be
    /// emitted after one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }

    /// Whether the streaming endpoint closes after delivering this event.
    pub fn closes_stream(&self) -> bool {
        self.is_terminal() || matches!(self, Self::ToolRequest { .. })
    }

    /// The JSON payload carried in the stream's `data:` field.
    pub fn payload(&self) -> Value {
        match self {
            Self::Connected {
                conversation_id,
                status,
            } => json!({ "conversation_id": conversation_id, "status": status }),
            Self::TextChunk {
                conversation_id,
                chunk,
                kind,
            } => json!({
                "conversation_id": conversation_id,
                "chunk": chunk,
                "kind": kind.as_str(),
            }),
            Self::ToolRequest {
                conversation_id,
                request,
                stats,
            } => json!({
                "conversation_id": conversation_id,
                "tool_request": {
                    "call_id": request.call_id,
                    "name": request.name,
                    "arguments": request.arguments,
                },
                "submit_url": format!("/conversations/{conversation_id}/tool-results"),
                "stats": stats,
            }),
            Self::ToolExecuting {
                conversation_id,
                call,
            } => json!({
                "conversation_id": conversation_id,
                "tool": {
                    "call_id": call.id,
                    "name": call.name,
                    "arguments": call.arguments,
                },
            }),
            Self::ToolCompleted {
                conversation_id,
                call_id,
                name,
                success,
                content,
            } => json!({
                "conversation_id": conversation_id,
                "call_id": call_id,
                "name": name,
                "success": success,
                "content": content,
            }),
            Self::Completed {
                conversation_id,
                stats,
                last_assistant,
            } => {
                let mut v = json!({
                    "status": "completed",
                    "conversation_id": conversation_id,
                    "stats": stats,
                });
                if let Some(m) = last_assistant {
                    v["messages"] = json!([m.to_wire()]);
                }
                v
            }
            Self::Failed {
                conversation_id,
                error,
                stats,
            } => json!({
                "status": "failed",
                "conversation_id": conversation_id,
                "error": error,
                "stats": stats,
            }),
            Self::Cancelled {
                conversation_id,
                stats,
            } => json!({
                "status": "cancelled",
                "conversation_id": conversation_id,
                "stats": stats,
            }),
            Self::Error {
                conversation_id,
                error,
            } => json!({
                "conversation_id": conversation_id,
                "error": error,
            }),
            Self::Heartbeat => json!({}),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
