// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Shared driver for OpenAI-compatible chat completion APIs.
//!
//! Several providers speak the same `/chat/completions` SSE wire format; this
//! module provides a single `OpenAiCompatDriver` that each such driver
//! (`openai`, `vllm`, `huggingface`) configures with its own base URL and
//! auth style.

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

/// How to send the API key in HTTP requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>` — hosted providers.
    Bearer,
    /// No authentication header — local servers (vLLM without a token).
    None,
}

pub struct OpenAiCompatDriver {
    /// Driver id returned by `BackendDriver::name()`.
    driver_name: &'static str,
    cfg: NormalizedModelConfig,
    api_key: Option<String>,
    /// Full chat completions URL.
    chat_url: String,
    auth_style: AuthStyle,
    client: reqwest::Client,
}

impl OpenAiCompatDriver {
    /// Bind a driver to a resolved configuration.  No I/O.
    pub fn with_config(
        driver_name: &'static str,
        cfg: NormalizedModelConfig,
        base_url: &str,
        api_key: Option<String>,
        auth_style: AuthStyle,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            driver_name,
            api_key,
            chat_url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            auth_style,
            cfg,
            client,
        }
    }
}

#[async_trait]
impl BackendDriver for OpenAiCompatDriver {
    fn name(&self) -> &str {
        self.driver_name
    }

    fn model(&self) -> &str {
        &self.cfg.model
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: true,
            function_calling: true,
            vision: self.driver_name == "openai",
            model_management: false,
            embeddings: self.driver_name == "openai",
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

        let mut body = json!({
            "model": self.cfg.model,
            "messages": messages,
            "stream": true,
            "max_tokens": self.cfg.max_tokens,
            "temperature": self.cfg.temperature,
            "stream_options": { "include_usage": true },
        });
        if let Some(top_p) = self.cfg.top_p {
            body["top_p"] = json!(top_p);
        }
        if !req.tools.is_empty() {
            body["tools"] = json!(format_tool_schemas(&req.tools));
        }
        // Driver-specific extras override anything set above.
        for (k, v) in &self.cfg.extra {
            body[k.as_str()] = v.clone();
        }

        debug!(
            driver = self.driver_name,
            model = %self.cfg.model,
            tool_count = req.tools.len(),
            message_count = req.messages.len(),
            "sending completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        if self.auth_style == AuthStyle::Bearer {
            let key = self.api_key.as_deref().ok_or_else(|| {
                BackendError::Protocol(format!(
                    "{}: API key not set; provide api_key or api_key_env in config",
                    self.driver_name
                ))
            })?;
            http_req = http_req.bearer_auth(key);
        }

        let driver = self.driver_name;
        let timeout = self.cfg.timeout_secs;
        let resp = http_req
            .send()
            .await
            .map_err(|e| BackendError::from_transport(driver, e, timeout))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::from_status(driver, status, &text));
        }

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across TCP packets.  Maintain a line buffer
        // across chunks; emit events only for complete lines.
        let event_stream = byte_stream
            .scan(String::new(), move |buf, chunk| {
                let events: Vec<Result<ResponseEvent, BackendError>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(BackendError::from_transport(driver, e, timeout))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

// ─── Wire translation ─────────────────────────────────────────────────────────

/// Canonical tool schemas → OpenAI `tools` array.
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

/// OpenAI assistant-message payload → canonical tool calls.
///
/// Accepts either a full response message or a bare `tool_calls` array.
/// Ids absent from the payload are synthesized as `call_<n>` in order.
pub fn parse_tool_calls(payload: &Value) -> Vec<ToolCall> {
    let arr = payload
        .get("tool_calls")
        .and_then(Value::as_array)
        .or_else(|| payload.as_array());
    let Some(arr) = arr else {
        return Vec::new();
    };
    arr.iter()
        .enumerate()
        .filter_map(|(i, tc)| {
            let name = tc["function"]["name"].as_str()?.to_string();
            let id = match tc["id"].as_str() {
                Some(s) if !s.is_empty() => s.to_string(),
                _ => format!("call_{i}"),
            };
            let raw_args = tc["function"]["arguments"].clone();
            let arguments = match raw_args {
                Value::String(s) => serde_json::from_str(&s).unwrap_or_else(|_| json!({})),
                Value::Object(o) => Value::Object(o),
                _ => json!({}),
            };
            Some(ToolCall { id, name, arguments })
        })
        .collect()
}

/// Convert canonical messages into the OpenAI wire format.  The system prompt
/// is prepended separately by the caller.
pub fn build_wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
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
                let mut parts = vec![json!({ "type": "text", "text": content })];
                parts.extend(images.iter().map(|url| {
                    json!({ "type": "image_url", "image_url": { "url": url } })
                }));
                json!({ "role": "user", "content": parts })
            }
            ChatMessage::Assistant {
                content,
                tool_calls,
                ..
            } => {
                // Thinking is provider-internal scratchpad; it is never sent
                // back on subsequent requests.
                let mut v = json!({ "role": "assistant", "content": content });
                if !tool_calls.is_empty() {
                    let calls: Vec<Value> = tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": tc.arguments.to_string(),
                                }
                            })
                        })
                        .collect();
                    v["tool_calls"] = json!(calls);
                }
                v
            }
            ChatMessage::Tool { call_id, content } => {
                json!({ "role": "tool", "tool_call_id": call_id, "content": content })
            }
        })
        .collect()
}

// ─── SSE parsing ──────────────────────────────────────────────────────────────

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line is left in `buf` so it can be extended by the
/// next TCP chunk.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<Result<ResponseEvent, BackendError>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(Ok(ev));
        }
    }
    events
}

/// Parse a single complete SSE `data:` line into a [`ResponseEvent`].
///
/// Returns `None` for empty lines, comment lines, or unparseable data.
fn parse_sse_data_line(line: &str) -> Option<ResponseEvent> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(ResponseEvent::Done);
    }
    let v: Value = serde_json::from_str(data).ok()?;
    Some(parse_sse_chunk(&v))
}

pub(crate) fn parse_sse_chunk(v: &Value) -> ResponseEvent {
    // Usage-only chunk (emitted when stream_options.include_usage = true).
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return ResponseEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        };
    }

    let choice = &v["choices"][0];

    // finish_reason=length means the model hit its output-token limit.
    if choice["finish_reason"].as_str() == Some("length") {
        return ResponseEvent::MaxTokens;
    }

    let delta = &choice["delta"];

    if let Some(tool_calls) = delta.get("tool_calls") {
        if let Some(tc) = tool_calls.get(0) {
            return ResponseEvent::ToolCall {
                index: tc["index"].as_u64().unwrap_or(0) as u32,
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
            };
        }
    }

    // Reasoning deltas: `reasoning_content` (llama.cpp, DeepSeek, Qwen) or
    // `reasoning` (some aggregators).
    let thinking = delta
        .get("reasoning_content")
        .and_then(Value::as_str)
        .or_else(|| delta.get("reasoning").and_then(Value::as_str));
    if let Some(t) = thinking {
        if !t.is_empty() {
            return ResponseEvent::ThinkingDelta(t.to_string());
        }
    }

    if let Some(text) = delta.get("content").and_then(Value::as_str) {
        return ResponseEvent::TextDelta(text.to_string());
    }

    ResponseEvent::TextDelta(String::new())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
