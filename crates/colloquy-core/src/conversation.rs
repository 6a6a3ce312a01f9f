// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use colloquy_model::{tokens, ChatMessage, NormalizedModelConfig, ToolCall, ToolSchema};

/// Maximum pinned messages per conversation.
pub const MAX_PINNED_MESSAGES: usize = 10;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConversationStatus,
        to: ConversationStatus,
    },
    #[error("conversation is {0:?} and can no longer be modified")]
    Terminal(ConversationStatus),
    #[error("system prompt snapshot is already set")]
    SnapshotAlreadySet,
    #[error("pin limit of {MAX_PINNED_MESSAGES} messages reached")]
    PinLimit,
    #[error("no message at index {0}")]
    NoSuchMessage(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    /// No pending work.
    Active,
    /// An enqueued or running turn exists.
    Processing,
    /// Awaiting a client tool result.
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ConversationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The collapsed status string exposed by the polling endpoint:
    /// `active` and `processing` both read as `processing`.
    pub fn client_facing(self) -> &'static str {
        match self {
            Self::Active | Self::Processing => "processing",
            Self::Paused => "waiting_for_tool",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the state machine permits `self -> to`.
    pub fn can_transition(self, to: ConversationStatus) -> bool {
        use ConversationStatus::*;
        match (self, to) {
            // Terminal states are absorbing.
            (from, _) if from.is_terminal() => false,
            (Active, Processing) => true,
            (Processing, Processing) => true,
            (Processing, Completed) => true,
            (Processing, Paused) => true,
            (Paused, Processing) => true,
            (Active | Processing | Paused, Cancelled) => true,
            (_, Failed) => true,
            _ => false,
        }
    }
}

/// The single client-executable tool call awaiting a result, plus the tool
/// calls from the same assistant turn that have not been dispatched yet.
/// Its presence is synonymous with `status = paused`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingToolRequest {
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    /// Calls after the suspending one, resumed in order on submission.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remaining_calls: Vec<ToolCall>,
}

impl PendingToolRequest {
    pub fn new(call: &ToolCall, remaining_calls: Vec<ToolCall>) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            remaining_calls,
        }
    }
}

/// A transcript message plus engine bookkeeping.  Flattens over the message
/// in serde so a persisted transcript stays a flat list of role-tagged
/// records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEntry {
    #[serde(flatten)]
    pub message: ChatMessage,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pinned: bool,
    /// Cached token estimate (or the provider's actual count for assistant
    /// messages).  Filled on append.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
}

impl MessageEntry {
    pub fn new(message: ChatMessage) -> Self {
        Self {
            message,
            pinned: false,
            token_count: None,
        }
    }

    /// Cached token estimate, computing and storing it on first use.
    pub fn tokens(&mut self) -> u32 {
        if let Some(t) = self.token_count {
            return t;
        }
        let t = estimate_message_tokens(&self.message);
        self.token_count = Some(t);
        t
    }

    /// Token estimate without mutating the cache.
    pub fn tokens_estimate(&self) -> u32 {
        self.token_count
            .unwrap_or_else(|| estimate_message_tokens(&self.message))
    }
}

/// Content plus tool-call arguments; thinking is excluded because it is
/// never re-transmitted.
pub fn estimate_message_tokens(message: &ChatMessage) -> u32 {
    let mut t = tokens::estimate_tokens(message.content());
    for tc in message.tool_calls() {
        t += tokens::estimate_tokens(&tc.name);
        t += tokens::estimate_tokens(&tc.arguments.to_string());
    }
    t.max(1) as u32
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationStats {
    pub turns: u32,
    pub tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub messages: Vec<MessageEntry>,
    pub status: ConversationStatus,
    pub turn_count: u32,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_tool_request: Option<PendingToolRequest>,
    /// Tool names the connected client executes on its side.  A name listed
    /// here wins over any server tool of the same name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub client_tool_schemas: Vec<ToolSchema>,
    /// Frozen on the first turn; later template edits never affect this
    /// conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_snapshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_config_snapshot: Option<NormalizedModelConfig>,
    /// Short failure reason, set when the conversation transitions to failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(
        agent_id: impl Into<String>,
        user_id: Option<String>,
        client_tool_schemas: Vec<ToolSchema>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            user_id,
            messages: Vec::new(),
            status: ConversationStatus::Active,
            turn_count: 0,
            total_tokens: 0,
            pending_tool_request: None,
            client_tool_schemas,
            system_prompt_snapshot: None,
            model_config_snapshot: None,
            last_error: None,
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn stats(&self) -> ConversationStats {
        ConversationStats {
            turns: self.turn_count,
            tokens: self.total_tokens,
        }
    }

    /// Guarded status transition.  Terminal states are absorbing.
    pub fn transition(&mut self, to: ConversationStatus) -> Result<(), StateError> {
        if !self.status.can_transition(to) {
            if self.status.is_terminal() {
                return Err(StateError::Terminal(self.status));
            }
            return Err(StateError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.last_activity_at = Utc::now();
        Ok(())
    }

    /// Append a message.  Rejected once the conversation is terminal.
    pub fn push(&mut self, message: ChatMessage) -> Result<(), StateError> {
        if self.status.is_terminal() {
            return Err(StateError::Terminal(self.status));
        }
        let mut entry = MessageEntry::new(message);
        self.total_tokens += entry.tokens() as u64;
        self.messages.push(entry);
        self.last_activity_at = Utc::now();
        Ok(())
    }

    /// Append the assistant message for a finished model turn and advance the
    /// turn counter.  `actual_tokens` (the provider's output count) replaces
    /// the estimate when available.
    pub fn record_assistant_turn(
        &mut self,
        message: ChatMessage,
        actual_tokens: Option<u32>,
    ) -> Result<(), StateError> {
        if self.status.is_terminal() {
            return Err(StateError::Terminal(self.status));
        }
        let mut entry = MessageEntry::new(message);
        if let Some(t) = actual_tokens.filter(|&t| t > 0) {
            entry.token_count = Some(t);
        }
        self.total_tokens += entry.tokens() as u64;
        self.messages.push(entry);
        self.turn_count += 1;
        self.last_activity_at = Utc::now();
        Ok(())
    }

    /// Write the system prompt snapshot.  Exactly once per conversation.
    pub fn snapshot_prompts(
        &mut self,
        system_prompt: String,
        model_config: NormalizedModelConfig,
    ) -> Result<(), StateError> {
        if self.system_prompt_snapshot.is_some() {
            return Err(StateError::SnapshotAlreadySet);
        }
        self.system_prompt_snapshot = Some(system_prompt);
        self.model_config_snapshot = Some(model_config);
        Ok(())
    }

    /// Suspend on a client tool call: store the pending request and pause.
    pub fn suspend(&mut self, pending: PendingToolRequest) -> Result<(), StateError> {
        self.transition(ConversationStatus::Paused)?;
        self.pending_tool_request = Some(pending);
        Ok(())
    }

    /// Clear the pending request after a validated submission.
    pub fn clear_pending(&mut self) {
        self.pending_tool_request = None;
    }

    pub fn pin(&mut self, index: usize) -> Result<(), StateError> {
        if index >= self.messages.len() {
            return Err(StateError::NoSuchMessage(index));
        }
        if self.messages[index].pinned {
            return Ok(());
        }
        if self.messages.iter().filter(|e| e.pinned).count() >= MAX_PINNED_MESSAGES {
            return Err(StateError::PinLimit);
        }
        self.messages[index].pinned = true;
        Ok(())
    }

    /// Plain transcript messages for a driver request.
    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        self.messages.iter().map(|e| e.message.clone()).collect()
    }

    /// The most recent assistant message, if any.
    pub fn last_assistant(&self) -> Option<&ChatMessage> {
        self.messages
            .iter()
            .rev()
            .map(|e| &e.message)
            .find(|m| m.role() == colloquy_model::Role::Assistant)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
