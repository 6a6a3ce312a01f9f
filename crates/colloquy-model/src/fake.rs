// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    driver::{BackendDriver, Capabilities, ResponseStream},
    error::BackendError,
    types::{CompletionRequest, ResponseEvent},
};

const FAKE_CONTEXT_WINDOW: usize = 128_000;

/// Deterministic driver for tests.  Each call to `open_stream` pops the next
/// scripted event sequence; when the scripts run out (or none were given) it
/// echoes the last user message.  `last_request` captures what was sent so
/// tests can inspect filtering and prompt assembly.
pub struct FakeDriver {
    scripts: Mutex<Vec<Vec<ResponseEvent>>>,
    context_length: usize,
    /// The most recent `CompletionRequest` seen by this driver.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl FakeDriver {
    /// Build a driver from an ordered list of per-call event scripts.
    pub fn new(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            context_length: FAKE_CONTEXT_WINDOW,
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Shrink the claimed context window (for context-filter tests).
    pub fn with_context_length(mut self, tokens: usize) -> Self {
        self.context_length = tokens;
        self
    }

    /// Convenience: driver that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![vec![
            ResponseEvent::TextDelta(reply.into()),
            ResponseEvent::Usage {
                input_tokens: 5,
                output_tokens: 5,
            },
            ResponseEvent::Done,
        ]])
    }

    /// Convenience: a tool call on the first turn, a text reply on the second.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![
                ResponseEvent::ToolCall {
                    index: 0,
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                ResponseEvent::Usage {
                    input_tokens: 5,
                    output_tokens: 5,
                },
                ResponseEvent::Done,
            ],
            vec![
                ResponseEvent::TextDelta(final_text.into()),
                ResponseEvent::Usage {
                    input_tokens: 5,
                    output_tokens: 5,
                },
                ResponseEvent::Done,
            ],
        ])
    }
}

#[async_trait]
impl BackendDriver for FakeDriver {
    fn name(&self) -> &str {
        "fake"
    }

    fn model(&self) -> &str {
        "fake-model"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: true,
            function_calling: true,
            vision: false,
            model_management: false,
            embeddings: false,
            max_context: self.context_length,
        }
    }

    fn context_limit(&self) -> usize {
        self.context_length
    }

    async fn open_stream(&self, req: CompletionRequest) -> Result<ResponseStream, BackendError> {
        let echo = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role() == crate::types::Role::User)
            .map(|m| m.content().to_string())
            .unwrap_or_else(|| "[no input]".into());
        *self.last_request.lock().unwrap() = Some(req);

        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                vec![
                    ResponseEvent::TextDelta(format!("FAKE: {echo}")),
                    ResponseEvent::Usage {
                        input_tokens: 10,
                        output_tokens: 10,
                    },
                    ResponseEvent::Done,
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<Result<ResponseEvent, BackendError>> =
            events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
