// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Boundary operations: everything the HTTP layer calls into.
//!
//! Validates preconditions against the persisted conversation before any
//! queue or broadcaster interaction, so rejected requests never change state.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use colloquy_model::{ChatMessage, ToolResult, ToolSchema};

use crate::{
    broadcast::Broadcaster,
    conversation::{
        Conversation, ConversationStats, ConversationStatus, PendingToolRequest,
    },
    dispatch::{ToolDispatcher, ToolRoute},
    error::EngineError,
    events::ConversationEvent,
    queue::TurnQueue,
    store::ConversationStore,
};

/// The state payload returned by every boundary operation and the status
/// polling endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub status: &'static str,
    pub conversation_id: String,
    pub stats: ConversationStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_request: Option<ToolRequestView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ChatMessage>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolRequestView {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

impl StatusView {
    fn from_conversation(c: &Conversation) -> Self {
        let tool_request = c.pending_tool_request.as_ref().map(|p| ToolRequestView {
            call_id: p.call_id.clone(),
            name: p.name.clone(),
            arguments: p.arguments.clone(),
        });
        let messages = (c.status == ConversationStatus::Completed)
            .then(|| c.last_assistant().cloned().map(|m| vec![m]))
            .flatten();
        Self {
            status: c.status.client_facing(),
            conversation_id: c.id.clone(),
            stats: c.stats(),
            tool_request,
            error: c.last_error.clone(),
            messages,
        }
    }
}

pub struct ConversationService {
    store: Arc<dyn ConversationStore>,
    queue: Arc<TurnQueue>,
    broadcaster: Arc<Broadcaster>,
    dispatcher: Arc<ToolDispatcher>,
}

impl ConversationService {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        queue: Arc<TurnQueue>,
        broadcaster: Arc<Broadcaster>,
        dispatcher: Arc<ToolDispatcher>,
    ) -> Self {
        Self {
            store,
            queue,
            broadcaster,
            dispatcher,
        }
    }

    /// Create a conversation for an existing agent.
    pub async fn create(
        &self,
        agent_id: &str,
        user_id: Option<String>,
        client_tool_schemas: Vec<ToolSchema>,
    ) -> Result<Conversation, EngineError> {
        // Fails fast when the agent does not exist.
        self.store.load_profile(agent_id).await?;
        let conversation = Conversation::new(agent_id, user_id, client_tool_schemas);
        info!(conversation_id = %conversation.id, agent_id, "conversation created");
        self.store.create(conversation.clone()).await?;
        Ok(conversation)
    }

    /// Append a user message and enqueue a turn.
    pub async fn post_message(
        &self,
        conversation_id: &str,
        content: &str,
        images: Vec<String>,
    ) -> Result<StatusView, EngineError> {
        if content.trim().is_empty() {
            return Err(EngineError::Validation("message content is empty".into()));
        }
        let message = if images.is_empty() {
            ChatMessage::user(content)
        } else {
            ChatMessage::user_with_images(content, images)
        };
        let updated = self
            .store
            .mutate(
                conversation_id,
                Box::new(move |c| {
                    if c.status == ConversationStatus::Paused {
                        return Err(EngineError::Validation(
                            "conversation is waiting for a tool result".into(),
                        ));
                    }
                    c.push(message)?;
                    if c.status == ConversationStatus::Active {
                        c.transition(ConversationStatus::Processing)?;
                    }
                    Ok(())
                }),
            )
            .await?;
        self.queue.enqueue(conversation_id);
        Ok(StatusView::from_conversation(&updated))
    }

    /// Submit the result of a client-executed tool call.
    ///
    /// Preconditions: status is `paused` and the submitted call id matches
    /// the pending one.  A mismatch (including a duplicate submission after
    /// resume) is rejected without state change.  After the result is
    /// appended, iteration over the assistant turn's remaining tool calls
    /// continues in order; the next client call suspends again, otherwise a
    /// fresh turn is enqueued.
    pub async fn submit_tool_result(
        &self,
        conversation_id: &str,
        call_id: &str,
        success: bool,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<StatusView, EngineError> {
        let conversation = self.store.load(conversation_id).await?;
        let Some(pending) = conversation.pending_tool_request.clone() else {
            return Err(EngineError::Validation(
                "conversation has no pending tool request".into(),
            ));
        };
        if conversation.status != ConversationStatus::Paused {
            return Err(EngineError::Validation(
                "conversation is not waiting for a tool result".into(),
            ));
        }
        if pending.call_id != call_id {
            return Err(EngineError::Validation(format!(
                "call_id mismatch: pending request is {}",
                pending.call_id
            )));
        }

        let result = if success {
            ToolResult::success(output.unwrap_or_default())
        } else {
            ToolResult::failure(error.unwrap_or_else(|| "tool execution failed".into()))
        };
        let content = result.render();
        let expected = pending.call_id.clone();
        let tool_message = ChatMessage::tool(call_id, content);
        self.store
            .mutate(
                conversation_id,
                Box::new(move |c| {
                    // Re-validate under the store lock.
                    let still_pending = c
                        .pending_tool_request
                        .as_ref()
                        .map(|p| p.call_id == expected)
                        .unwrap_or(false);
                    if c.status != ConversationStatus::Paused || !still_pending {
                        return Err(EngineError::Validation(
                            "pending tool request changed during submission".into(),
                        ));
                    }
                    c.clear_pending();
                    c.transition(ConversationStatus::Processing)?;
                    c.push(tool_message)?;
                    Ok(())
                }),
            )
            .await?;
        debug!(conversation_id, call_id, "client tool result accepted");

        self.continue_tool_calls(conversation_id, pending.remaining_calls)
            .await
    }

    /// Continue the suspended assistant turn's remaining tool calls in the
    /// order received: server calls execute inline, the next client call
    /// suspends the conversation again.
    async fn continue_tool_calls(
        &self,
        conversation_id: &str,
        remaining: Vec<colloquy_model::ToolCall>,
    ) -> Result<StatusView, EngineError> {
        for (i, call) in remaining.iter().enumerate() {
            let conversation = self.store.load(conversation_id).await?;
            if conversation.status == ConversationStatus::Cancelled {
                return Ok(StatusView::from_conversation(&conversation));
            }
            match self.dispatcher.classify(&conversation, call) {
                ToolRoute::Client => {
                    let pending = PendingToolRequest::new(call, remaining[i + 1..].to_vec());
                    let to_store = pending.clone();
                    let updated = self
                        .store
                        .mutate(
                            conversation_id,
                            Box::new(move |c| c.suspend(to_store).map_err(Into::into)),
                        )
                        .await?;
                    self.broadcaster.emit(
                        conversation_id,
                        ConversationEvent::ToolRequest {
                            conversation_id: conversation_id.to_string(),
                            request: pending,
                            stats: updated.stats(),
                        },
                    );
                    return Ok(StatusView::from_conversation(&updated));
                }
                ToolRoute::Server | ToolRoute::System => {
                    self.broadcaster.emit(
                        conversation_id,
                        ConversationEvent::ToolExecuting {
                            conversation_id: conversation_id.to_string(),
                            call: call.clone(),
                        },
                    );
                    let result = self.dispatcher.execute(call).await;
                    let content = result.render();
                    let id = call.id.clone();
                    let to_store = content.clone();
                    self.store
                        .mutate(
                            conversation_id,
                            Box::new(move |c| {
                                c.push(ChatMessage::tool(id, to_store)).map_err(Into::into)
                            }),
                        )
                        .await?;
                    self.broadcaster.emit(
                        conversation_id,
                        ConversationEvent::ToolCompleted {
                            conversation_id: conversation_id.to_string(),
                            call_id: call.id.clone(),
                            name: call.name.clone(),
                            success: result.success,
                            content,
                        },
                    );
                }
            }
        }

        self.queue.enqueue(conversation_id);
        let conversation = self.store.load(conversation_id).await?;
        Ok(StatusView::from_conversation(&conversation))
    }

    /// Cancel a conversation.  Idempotent on terminal states.
    pub async fn cancel(&self, conversation_id: &str) -> Result<StatusView, EngineError> {
        let conversation = self.store.load(conversation_id).await?;
        if conversation.status.is_terminal() {
            return Ok(StatusView::from_conversation(&conversation));
        }
        let updated = self
            .store
            .mutate(
                conversation_id,
                Box::new(|c| {
                    if c.status.is_terminal() {
                        return Ok(());
                    }
                    c.transition(ConversationStatus::Cancelled)?;
                    // Paused-iff-pending must keep holding after the cancel.
                    c.clear_pending();
                    Ok(())
                }),
            )
            .await?;
        if updated.status == ConversationStatus::Cancelled {
            info!(conversation_id, "conversation cancelled");
            self.broadcaster.emit(
                conversation_id,
                ConversationEvent::Cancelled {
                    conversation_id: conversation_id.to_string(),
                    stats: updated.stats(),
                },
            );
        }
        Ok(StatusView::from_conversation(&updated))
    }

    pub async fn status(&self, conversation_id: &str) -> Result<StatusView, EngineError> {
        let conversation = self.store.load(conversation_id).await?;
        Ok(StatusView::from_conversation(&conversation))
    }

    /// Terminal conversations may still be deleted.
    pub async fn delete(&self, conversation_id: &str) -> Result<(), EngineError> {
        self.store.delete(conversation_id).await?;
        self.broadcaster.queue().remove(conversation_id);
        Ok(())
    }

    pub async fn load(&self, conversation_id: &str) -> Result<Conversation, EngineError> {
        self.store.load(conversation_id).await
    }
}
