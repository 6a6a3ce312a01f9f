// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The turn processor: one iteration of the agentic loop, run as a
//! single-attempt background job.
//!
//! A turn loads the conversation and its frozen agent profile, binds a fresh
//! driver, streams one model call, then routes the resulting tool calls —
//! server tools execute inline, a client tool suspends the conversation.
//! Cancellation is cooperative: the persisted status is re-read at the start,
//! after the model call, between tool calls, and before re-enqueueing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use colloquy_config::BackendSettings;
use colloquy_model::{
    normalize, BackendDriver, BackendError, ChatMessage, ChunkKind, ChunkSink, CompletionRequest,
    NormalizedModelConfig,
};

use crate::{
    agent::AgentProfile,
    broadcast::Broadcaster,
    context::{ContextFilter, FilterParams},
    conversation::{Conversation, ConversationStatus, PendingToolRequest},
    dispatch::{ToolDispatcher, ToolRoute},
    error::EngineError,
    events::ConversationEvent,
    prompt,
    queue::TurnQueue,
    store::ConversationStore,
};

/// Constructs a driver bound to a resolved configuration.  Pluggable so
/// tests can substitute scripted fakes; production wiring uses
/// [`default_driver_factory`].
pub type DriverFactory = Arc<
    dyn Fn(&str, NormalizedModelConfig, &BackendSettings) -> Result<Box<dyn BackendDriver>, BackendError>
        + Send
        + Sync,
>;

pub fn default_driver_factory() -> DriverFactory {
    Arc::new(|driver, cfg, settings| colloquy_model::with_config(driver, cfg, settings))
}

/// Bridges driver text deltas to `text_chunk` events.
struct BroadcastSink<'a> {
    broadcaster: &'a Broadcaster,
    conversation_id: &'a str,
}

impl ChunkSink for BroadcastSink<'_> {
    fn emit(&self, kind: ChunkKind, text: &str) {
        self.broadcaster.emit(
            self.conversation_id,
            ConversationEvent::TextChunk {
                conversation_id: self.conversation_id.to_string(),
                chunk: text.to_string(),
                kind,
            },
        );
    }
}

pub struct TurnProcessor {
    store: Arc<dyn ConversationStore>,
    broadcaster: Arc<Broadcaster>,
    dispatcher: Arc<ToolDispatcher>,
    queue: Arc<TurnQueue>,
    filter: ContextFilter,
    backends: HashMap<String, BackendSettings>,
    drivers: DriverFactory,
}

impl TurnProcessor {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        broadcaster: Arc<Broadcaster>,
        dispatcher: Arc<ToolDispatcher>,
        queue: Arc<TurnQueue>,
        filter: ContextFilter,
        backends: HashMap<String, BackendSettings>,
        drivers: DriverFactory,
    ) -> Self {
        Self {
            store,
            broadcaster,
            dispatcher,
            queue,
            filter,
            backends,
            drivers,
        }
    }

    /// Process one turn.  Never returns an error: failures terminalize the
    /// conversation as `failed` and emit the matching event.
    pub async fn process(&self, conversation_id: &str) {
        if let Err(e) = self.run_turn(conversation_id).await {
            self.fail(conversation_id, &e.to_string()).await;
        }
    }

    /// Transition to `failed` and emit the `failed` event.  A conversation
    /// that reached a terminal state first (cancellation wins) is left alone.
    pub async fn fail(&self, conversation_id: &str, message: &str) {
        let reason = message.to_string();
        let result = self
            .store
            .mutate(
                conversation_id,
                Box::new(move |c| {
                    c.transition(ConversationStatus::Failed)?;
                    c.last_error = Some(reason);
                    Ok(())
                }),
            )
            .await;
        match result {
            Ok(updated) => {
                warn!(conversation_id, error = message, "turn failed");
                self.broadcaster.emit(
                    conversation_id,
                    ConversationEvent::Failed {
                        conversation_id: conversation_id.to_string(),
                        error: message.to_string(),
                        stats: updated.stats(),
                    },
                );
            }
            Err(e) => {
                debug!(conversation_id, error = %e, "skipping failure transition");
            }
        }
    }

    async fn is_cancelled(&self, conversation_id: &str) -> Result<bool, EngineError> {
        Ok(self.store.load(conversation_id).await?.status == ConversationStatus::Cancelled)
    }

    async fn run_turn(&self, conversation_id: &str) -> Result<(), EngineError> {
        let conversation = self.store.load(conversation_id).await?;
        // Cancellation has already emitted its event elsewhere; just exit.
        if conversation.status == ConversationStatus::Cancelled {
            return Ok(());
        }
        let profile = self.store.load_profile(&conversation.agent_id).await?;
        if conversation.turn_count >= profile.max_turns {
            return Err(EngineError::MaxTurns);
        }

        let settings = self
            .backends
            .get(&profile.backend)
            .cloned()
            .unwrap_or_default();
        // The snapshot freezes the first turn's resolution; later agent edits
        // never affect an in-flight conversation.
        let model_cfg = match &conversation.model_config_snapshot {
            Some(snapshot) => snapshot.clone(),
            None => {
                let (cfg, warnings) = normalize(&profile.backend, &settings, &profile.model)?;
                // Dropped or clamped parameters are surfaced, never silent.
                for warning in warnings {
                    self.broadcaster.emit(
                        conversation_id,
                        ConversationEvent::Error {
                            conversation_id: conversation_id.to_string(),
                            error: warning,
                        },
                    );
                }
                cfg
            }
        };

        let driver = (self.drivers)(&profile.backend, model_cfg.clone(), &settings)?;
        let outcome = self
            .drive(conversation_id, conversation, &profile, &model_cfg, driver.as_ref())
            .await;
        // Release driver resources on every path.
        driver.disconnect().await;
        outcome
    }

    async fn drive(
        &self,
        conversation_id: &str,
        conversation: Conversation,
        profile: &AgentProfile,
        model_cfg: &NormalizedModelConfig,
        driver: &dyn BackendDriver,
    ) -> Result<(), EngineError> {
        let system_prompt = match &conversation.system_prompt_snapshot {
            Some(s) => s.clone(),
            None => prompt::assemble(profile)?,
        };
        let tool_schemas = self.dispatcher.schemas_for(profile, &conversation);

        let params = FilterParams {
            system_prompt_tokens: driver.count_tokens(&system_prompt),
            tool_schema_tokens: tool_schemas
                .iter()
                .map(|s| {
                    driver.count_tokens(&s.name)
                        + driver.count_tokens(&s.description)
                        + driver.count_tokens(&s.parameters.to_string())
                })
                .sum(),
            context_limit: driver.context_limit(),
            max_output_tokens: model_cfg.max_tokens as usize,
        };
        let entries = conversation.messages.clone();
        let entries = if self
            .filter
            .should_trigger(&entries, params, profile.context_threshold)
        {
            info!(conversation_id, "context threshold exceeded; filtering transcript");
            self.filter
                .filter(entries, &profile.context_strategy, params, driver)
                .await
        } else {
            entries
        };
        let messages: Vec<ChatMessage> = entries.into_iter().map(|e| e.message).collect();

        // Checkpoint before the long-running model call.
        if self.is_cancelled(conversation_id).await? {
            return Ok(());
        }

        let sink = BroadcastSink {
            broadcaster: self.broadcaster.as_ref(),
            conversation_id,
        };
        let request = CompletionRequest {
            system: system_prompt.clone(),
            messages,
            tools: tool_schemas,
        };
        let response = driver.stream_execute(request, &sink).await?;

        // Chunks that raced with a cancellation have been dropped by the
        // closing streams; observe the cancel and discard the result.
        if self.is_cancelled(conversation_id).await? {
            return Ok(());
        }

        let assistant = ChatMessage::assistant_with_tools(
            response.content.clone(),
            response.tool_calls.clone(),
            response.thinking.clone(),
        );
        let snapshot = conversation
            .system_prompt_snapshot
            .is_none()
            .then(|| (system_prompt, model_cfg.clone()));
        let output_tokens = response.tokens_used.output_tokens;
        let updated = self
            .store
            .mutate(
                conversation_id,
                Box::new(move |c| {
                    // First turn: persist the snapshot atomically with the
                    // turn increment.
                    if let Some((sp, mc)) = snapshot {
                        if c.system_prompt_snapshot.is_none() {
                            c.snapshot_prompts(sp, mc)?;
                        }
                    }
                    c.record_assistant_turn(assistant, Some(output_tokens))?;
                    Ok(())
                }),
            )
            .await?;

        if response.tool_calls.is_empty() {
            let updated = self
                .store
                .mutate(
                    conversation_id,
                    Box::new(|c| c.transition(ConversationStatus::Completed).map_err(Into::into)),
                )
                .await?;
            self.broadcaster.emit(
                conversation_id,
                ConversationEvent::Completed {
                    conversation_id: conversation_id.to_string(),
                    stats: updated.stats(),
                    last_assistant: updated.last_assistant().cloned(),
                },
            );
            return Ok(());
        }

        let calls = response.tool_calls;
        for (i, call) in calls.iter().enumerate() {
            // Checkpoint between tool calls.
            if self.is_cancelled(conversation_id).await? {
                return Ok(());
            }
            match self.dispatcher.classify(&updated, call) {
                ToolRoute::Client => {
                    let pending = PendingToolRequest::new(call, calls[i + 1..].to_vec());
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
                    return Ok(());
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
                    let call_id = call.id.clone();
                    let to_store = content.clone();
                    self.store
                        .mutate(
                            conversation_id,
                            Box::new(move |c| {
                                c.push(ChatMessage::tool(call_id, to_store)).map_err(Into::into)
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

        // All calls were server-side; checkpoint, then hand the conversation
        // back to the queue for the next turn.
        if self.is_cancelled(conversation_id).await? {
            return Ok(());
        }
        self.queue.enqueue(conversation_id);
        Ok(())
    }
}

/// Spawn the worker pool.  Each worker claims leased conversations and runs
/// turns under the per-turn wall-clock timeout; an exceeded turn fails the
/// conversation with `"timeout"`.
pub fn spawn_workers(
    processor: Arc<TurnProcessor>,
    queue: Arc<TurnQueue>,
    count: usize,
    turn_timeout: Duration,
) -> Vec<JoinHandle<()>> {
    // The turn timeout must sit comfortably above any driver timeout.
    let timeout = turn_timeout.max(Duration::from_secs(600));
    (0..count.max(1))
        .map(|worker| {
            let processor = Arc::clone(&processor);
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                debug!(worker, "turn worker started");
                loop {
                    let id = queue.claim().await;
                    if tokio::time::timeout(timeout, processor.process(&id))
                        .await
                        .is_err()
                    {
                        warn!(worker, conversation_id = %id, "turn exceeded wall-clock timeout");
                        processor.fail(&id, "timeout").await;
                    }
                    queue.release(&id);
                }
            })
        })
        .collect()
}
