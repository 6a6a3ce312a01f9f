// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tracing::warn;

use crate::{
    error::BackendError,
    types::{AiResponse, ChunkKind, CompletionRequest, FinishReason, ResponseEvent, TokenUsage, ToolCall},
};

pub type ResponseStream =
    Pin<Box<dyn Stream<Item = Result<ResponseEvent, BackendError>> + Send>>;

/// Receives incremental text deltas during `stream_execute`.
///
/// An explicit interface rather than a closure so drivers never capture
/// mutable state; the broadcaster implements this to forward chunks as
/// `text_chunk` events.  Called on the driver's polling task.
pub trait ChunkSink: Send + Sync {
    fn emit(&self, kind: ChunkKind, text: &str);
}

/// Sink that discards every chunk.  Used by the one-shot `execute` path.
pub struct NullSink;

impl ChunkSink for NullSink {
    fn emit(&self, _kind: ChunkKind, _text: &str) {}
}

/// Capability set reported by a driver for its bound model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub streaming: bool,
    pub function_calling: bool,
    pub vision: bool,
    pub model_management: bool,
    pub embeddings: bool,
    pub max_context: usize,
}

/// Uniform interface over heterogeneous LLM providers.
///
/// Drivers implement `open_stream` (the provider-specific transport) and the
/// metadata accessors; `execute` / `stream_execute` are shared assembly logic
/// so every provider produces identical [`AiResponse`] semantics — including
/// `call_<n>` id synthesis for providers that stream unnamed tool calls.
#[async_trait]
pub trait BackendDriver: Send + Sync {
    /// Driver id, e.g. `"anthropic"`.
    fn name(&self) -> &str;

    /// Model the driver is bound to.
    fn model(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Context window in tokens for the bound model.  Conservative: callers
    /// may rely on a request of this size (minus output reservation) fitting.
    fn context_limit(&self) -> usize;

    /// Conservative token estimate for `text`.
    fn count_tokens(&self, text: &str) -> usize {
        crate::tokens::estimate_tokens(text)
    }

    /// Open the provider's event stream for one completion.
    async fn open_stream(&self, req: CompletionRequest) -> Result<ResponseStream, BackendError>;

    /// One-shot call; no chunk callbacks.
    async fn execute(&self, req: CompletionRequest) -> Result<AiResponse, BackendError> {
        self.stream_execute(req, &NullSink).await
    }

    /// Streaming call.  Content and thinking deltas are forwarded to `sink`
    /// as they arrive; partial tool-call text is never emitted.  Returns the
    /// fully assembled response at end-of-turn.
    async fn stream_execute(
        &self,
        req: CompletionRequest,
        sink: &dyn ChunkSink,
    ) -> Result<AiResponse, BackendError> {
        let stream = self.open_stream(req).await?;
        assemble_response(self.name(), self.model(), stream, sink).await
    }

    /// Release any pooled connections.  Idempotent.
    async fn disconnect(&self) {}
}

// ─── Response assembly ────────────────────────────────────────────────────────

struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    /// Resolve the accumulated fragments into a [`ToolCall`], synthesizing a
    /// `call_<n>` id when the provider did not emit one.  Arguments always
    /// resolve to a JSON object; invalid JSON degrades to `{}` rather than
    /// failing the turn.
    fn finish(self, driver: &str, ordinal: usize) -> ToolCall {
        let id = if self.id.is_empty() {
            format!("call_{ordinal}")
        } else {
            self.id
        };
        let arguments = if self.args_buf.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        driver,
                        tool_name = %self.name,
                        error = %e,
                        "model sent tool call with invalid JSON arguments; substituting {{}}"
                    );
                    serde_json::Value::Object(Default::default())
                }
            }
        };
        ToolCall {
            id,
            name: self.name,
            arguments,
        }
    }
}

/// Drive a driver's event stream to completion, forwarding deltas to `sink`
/// and assembling the final [`AiResponse`].
pub(crate) async fn assemble_response(
    driver: &str,
    model: &str,
    mut stream: ResponseStream,
    sink: &dyn ChunkSink,
) -> Result<AiResponse, BackendError> {
    let mut content = String::new();
    let mut thinking = String::new();
    let mut usage = TokenUsage::default();
    let mut hit_max_tokens = false;
    // Keyed by the provider's parallel-tool-call index; providers without
    // parallel calls always use index 0..n in emit order.
    let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();

    while let Some(event) = stream.next().await {
        match event? {
            ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                sink.emit(ChunkKind::Content, &delta);
                content.push_str(&delta);
            }
            ResponseEvent::TextDelta(_) => {}
            ResponseEvent::ThinkingDelta(delta) => {
                sink.emit(ChunkKind::Thinking, &delta);
                thinking.push_str(&delta);
            }
            ResponseEvent::ToolCall {
                index,
                id,
                name,
                arguments,
            } => {
                let ptc = pending.entry(index).or_insert_with(|| PendingToolCall {
                    id: String::new(),
                    name: String::new(),
                    args_buf: String::new(),
                });
                if !id.is_empty() {
                    ptc.id = id;
                }
                if !name.is_empty() {
                    ptc.name = name;
                }
                ptc.args_buf.push_str(&arguments);
            }
            ResponseEvent::Usage {
                input_tokens,
                output_tokens,
            } => {
                if input_tokens > 0 {
                    usage.input_tokens = input_tokens;
                }
                if output_tokens > 0 {
                    usage.output_tokens = output_tokens;
                }
            }
            ResponseEvent::MaxTokens => hit_max_tokens = true,
            ResponseEvent::Done => break,
        }
    }

    // Flush pending tool calls ordered by provider index.  Calls without a
    // name cannot be dispatched and would corrupt the transcript on the next
    // request, so they are dropped.
    let mut sorted: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
    sorted.sort_by_key(|(idx, _)| *idx);
    let mut tool_calls = Vec::with_capacity(sorted.len());
    for (ordinal, (_, ptc)) in sorted.into_iter().enumerate() {
        if ptc.name.is_empty() {
            warn!(driver, "dropping tool call with empty name from model");
            continue;
        }
        tool_calls.push(ptc.finish(driver, ordinal));
    }

    let finish_reason = if hit_max_tokens {
        FinishReason::Length
    } else if !tool_calls.is_empty() {
        FinishReason::ToolCalls
    } else {
        FinishReason::Stop
    };

    Ok(AiResponse {
        content,
        model: model.to_string(),
        tokens_used: usage,
        finish_reason,
        tool_calls,
        thinking: if thinking.is_empty() { None } else { Some(thinking) },
        metadata: serde_json::Map::new(),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
