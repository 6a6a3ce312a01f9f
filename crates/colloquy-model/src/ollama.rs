// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Native Ollama driver using the `/api/chat` NDJSON streaming API.
//!
//! Ollama never emits tool-call ids, so ids are synthesized as `call_<n>` in
//! turn-local order during response assembly; the wire builder here likewise
//! drops ids on the way out (Ollama matches tool results by position).

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    config::NormalizedModelConfig,
    driver::{BackendDriver, Capabilities, ResponseStream},
    error::BackendError,
    types::{ChatMessage, CompletionRequest, ResponseEvent, ToolCall, ToolSchema},
};

pub struct OllamaDriver {
    cfg: NormalizedModelConfig,
    base_url: String,
    client: reqwest::Client,
}

impl OllamaDriver {
    /// Bind a driver to a resolved configuration.  No I/O.
    pub fn with_config(cfg: NormalizedModelConfig, base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            base_url,
            cfg,
            client,
        }
    }
}

#[async_trait]
impl BackendDriver for OllamaDriver {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.cfg.model
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: true,
            function_calling: true,
            vision: true,
            // Ollama can pull/list models through its management API.
            model_management: true,
            embeddings: true,
            max_context: self.cfg.context_length,
        }
    }

    fn context_limit(&self) -> usize {
        self.cfg.context_length
    }

    async fn open_stream(&self, req: CompletionRequest) -> Result<ResponseStream, BackendError> {
        let mut messages = Vec::with_capacity(req.messages.len() + 1);
        if !req.system.is_empty() {
            messages.push(json!({ "role": "system", "content": req.system }));
        }
        messages.extend(build_wire_messages(&req.messages));

        let mut options = json!({
            "temperature": self.cfg.temperature,
            "num_ctx": self.cfg.context_length,
            "num_predict": self.cfg.max_tokens,
        });
        if let Some(top_p) = self.cfg.top_p {
            options["top_p"] = json!(top_p);
        }
        if let Some(top_k) = self.cfg.top_k {
            options["top_k"] = json!(top_k);
        }
        for (k, v) in &self.cfg.extra {
            options[k.as_str()] = v.clone();
        }

        let mut body = json!({
            "model": self.cfg.model,
            "messages": messages,
            "stream": true,
            "options": options,
        });
        if !req.tools.is_empty() {
            body["tools"] = json!(format_tool_schemas(&req.tools));
        }

        debug!(
            model = %self.cfg.model,
            tool_count = req.tools.len(),
            message_count = req.messages.len(),
            "sending ollama request"
        );

        let timeout = self.cfg.timeout_secs;
        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::from_transport("ollama", e, timeout))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::from_status("ollama", status, &text));
        }

        let byte_stream = resp.bytes_stream();
        // NDJSON: one JSON object per line.  Lines can be split across TCP
        // chunks; the scan state carries the remainder plus a running
        // tool-call index so parallel calls keep their emit order.
        let event_stream = byte_stream
            .scan((String::new(), 0u32), move |(buf, tc_index), chunk| {
                let events: Vec<Result<ResponseEvent, BackendError>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        let mut out = Vec::new();
                        while let Some(pos) = buf.find('\n') {
                            let line = buf[..pos].trim().to_string();
                            buf.drain(..=pos);
                            if line.is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<Value>(&line) {
                                Ok(v) => out.extend(parse_chunk(&v, tc_index).into_iter().map(Ok)),
                                Err(e) => out.push(Err(BackendError::Protocol(format!(
                                    "ollama: invalid NDJSON line: {e}"
                                )))),
                            }
                        }
                        out
                    }
                    Err(e) => vec![Err(BackendError::from_transport("ollama", e, timeout))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

// ─── Wire translation ─────────────────────────────────────────────────────────

/// Canonical tool schemas → Ollama `tools` array (OpenAI function shape).
pub fn format_tool_schemas(tools: &[ToolSchema]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}

/// Ollama response message → canonical tool calls with synthesized ids.
pub fn parse_tool_calls(payload: &Value) -> Vec<ToolCall> {
    let arr = payload
        .get("message")
        .and_then(|m| m.get("tool_calls"))
        .or_else(|| payload.get("tool_calls"))
        .and_then(Value::as_array);
    let Some(arr) = arr else {
        return Vec::new();
    };
    arr.iter()
        .enumerate()
        .filter_map(|(i, tc)| {
            let name = tc["function"]["name"].as_str()?.to_string();
            let arguments = tc["function"]["arguments"].clone();
            let arguments = if arguments.is_object() { arguments } else { json!({}) };
            Some(ToolCall {
                id: format!("call_{i}"),
                name,
                arguments,
            })
        })
        .collect()
}

pub(crate) fn build_wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| match m {
            ChatMessage::System { content } => {
                json!({ "role": "system", "content": content })
            }
            ChatMessage::User { content, images } if images.is_empty() => {
                json!({ "role": "user", "content": content })
            }
            ChatMessage::User { content, images } => {
                // Ollama takes raw base64 without the data-URL prefix.
                let raw: Vec<&str> = images
                    .iter()
                    .map(|u| u.rsplit_once(',').map(|(_, b64)| b64).unwrap_or(u))
                    .collect();
                json!({ "role": "user", "content": content, "images": raw })
            }
            ChatMessage::Assistant {
                content,
                tool_calls,
                ..
            } => {
                let mut v = json!({ "role": "assistant", "content": content });
                if !tool_calls.is_empty() {
                    let calls: Vec<Value> = tool_calls
                        .iter()
                        .map(|tc| {
                            json!({ "function": { "name": tc.name, "arguments": tc.arguments } })
                        })
                        .collect();
                    v["tool_calls"] = json!(calls);
                }
                v
            }
            // Ollama has no tool_call_id field; results match by position.
            ChatMessage::Tool { content, .. } => {
                json!({ "role": "tool", "content": content })
            }
        })
        .collect()
}

// ─── NDJSON chunk parsing ─────────────────────────────────────────────────────

/// Parse one NDJSON object into zero or more events, advancing the running
/// tool-call index for each call encountered.
pub(crate) fn parse_chunk(v: &Value, tc_index: &mut u32) -> Vec<ResponseEvent> {
    let mut events = Vec::new();
    let message = &v["message"];

    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for tc in calls {
            let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
            let arguments = tc["function"]["arguments"].clone();
            events.push(ResponseEvent::ToolCall {
                index: *tc_index,
                // No id on the wire; assembly synthesizes call_<n>.
                id: String::new(),
                name,
                arguments: if arguments.is_null() {
                    String::new()
                } else {
                    arguments.to_string()
                },
            });
            *tc_index += 1;
        }
    }

    if let Some(text) = message["content"].as_str() {
        if !text.is_empty() {
            events.push(ResponseEvent::TextDelta(text.to_string()));
        }
    }
    if let Some(thinking) = message["thinking"].as_str() {
        if !thinking.is_empty() {
            events.push(ResponseEvent::ThinkingDelta(thinking.to_string()));
        }
    }

    if v["done"].as_bool() == Some(true) {
        if v["done_reason"].as_str() == Some("length") {
            events.push(ResponseEvent::MaxTokens);
        }
        events.push(ResponseEvent::Usage {
            input_tokens: v["prompt_eval_count"].as_u64().unwrap_or(0) as u32,
            output_tokens: v["eval_count"].as_u64().unwrap_or(0) as u32,
        });
        events.push(ResponseEvent::Done);
    }

    events
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
