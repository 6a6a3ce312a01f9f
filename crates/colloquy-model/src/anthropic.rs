// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
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

pub struct AnthropicDriver {
    cfg: NormalizedModelConfig,
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicDriver {
    /// Bind a driver to a resolved configuration.  No I/O.
    pub fn with_config(cfg: NormalizedModelConfig, base_url: String, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            api_key,
            base_url,
            cfg,
            client,
        }
    }
}

#[async_trait]
impl BackendDriver for AnthropicDriver {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.cfg.model
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: true,
            function_calling: true,
            vision: true,
            model_management: false,
            embeddings: false,
            max_context: self.cfg.context_length,
        }
    }

    fn context_limit(&self) -> usize {
        self.cfg.context_length
    }

    async fn open_stream(&self, req: CompletionRequest) -> Result<ResponseStream, BackendError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| BackendError::Protocol("ANTHROPIC_API_KEY not set".into()))?;

        let messages = build_wire_messages(&req.messages);

        let mut body = json!({
            "model": self.cfg.model,
            "messages": messages,
            "max_tokens": self.cfg.max_tokens,
            "temperature": self.cfg.temperature,
            "stream": true,
        });
        if !req.system.is_empty() {
            body["system"] = json!(req.system);
        }
        if let Some(top_p) = self.cfg.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(top_k) = self.cfg.top_k {
            body["top_k"] = json!(top_k);
        }
        if !req.tools.is_empty() {
            body["tools"] = json!(format_tool_schemas(&req.tools));
        }
        for (k, v) in &self.cfg.extra {
            body[k.as_str()] = v.clone();
        }

        debug!(
            model = %self.cfg.model,
            tool_count = req.tools.len(),
            message_count = req.messages.len(),
            "sending anthropic request"
        );

        let timeout = self.cfg.timeout_secs;
        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::from_transport("anthropic", e, timeout))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::from_status("anthropic", status, &text));
        }

        let byte_stream = resp.bytes_stream();
        // SSE lines can be split across TCP chunks, so carry a remainder
        // buffer forward; only complete lines are parsed.
        let event_stream = byte_stream
            .scan(String::new(), move |buf, chunk| {
                let events: Vec<Result<ResponseEvent, BackendError>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        let mut out = Vec::new();
                        while let Some(pos) = buf.find('\n') {
                            let line = buf[..pos].trim_end_matches('\r').to_string();
                            buf.drain(..=pos);
                            if let Some(data) = line.strip_prefix("data: ") {
                                if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                                    out.push(Ok(parse_stream_event(&v)));
                                }
                            }
                        }
                        out
                    }
                    Err(e) => vec![Err(BackendError::from_transport("anthropic", e, timeout))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

// ─── Wire translation ─────────────────────────────────────────────────────────

/// Canonical tool schemas → Anthropic `tools` array.
pub fn format_tool_schemas(tools: &[ToolSchema]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.parameters,
            })
        })
        .collect()
}

/// Anthropic response content blocks → canonical tool calls.
///
/// Accepts a full response message (`content` array) or a bare block array.
pub fn parse_tool_calls(payload: &Value) -> Vec<ToolCall> {
    let blocks = payload
        .get("content")
        .and_then(Value::as_array)
        .or_else(|| payload.as_array());
    let Some(blocks) = blocks else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter(|b| b["type"].as_str() == Some("tool_use"))
        .enumerate()
        .filter_map(|(i, b)| {
            let name = b["name"].as_str()?.to_string();
            let id = match b["id"].as_str() {
                Some(s) if !s.is_empty() => s.to_string(),
                _ => format!("call_{i}"),
            };
            let arguments = b.get("input").cloned().unwrap_or_else(|| json!({}));
            Some(ToolCall { id, name, arguments })
        })
        .collect()
}

/// Convert canonical messages into the Anthropic wire format.  The system
/// prompt travels as a top-level field and is handled by the caller.
pub(crate) fn build_wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(messages.len());
    for m in messages {
        match m {
            // A system message inside the transcript (e.g. a summarization
            // marker) is folded into a user turn; Anthropic rejects the role.
            ChatMessage::System { content } => {
                out.push(json!({ "role": "user", "content": content }));
            }
            ChatMessage::User { content, images } if images.is_empty() => {
                out.push(json!({ "role": "user", "content": content }));
            }
            ChatMessage::User { content, images } => {
                let mut blocks = vec![json!({ "type": "text", "text": content })];
                for url in images {
                    blocks.push(image_block(url));
                }
                out.push(json!({ "role": "user", "content": blocks }));
            }
            ChatMessage::Assistant {
                content,
                tool_calls,
                ..
            } => {
                let mut blocks: Vec<Value> = Vec::new();
                if !content.is_empty() {
                    blocks.push(json!({ "type": "text", "text": content }));
                }
                for tc in tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": tc.id,
                        "name": tc.name,
                        "input": tc.arguments,
                    }));
                }
                if blocks.is_empty() {
                    blocks.push(json!({ "type": "text", "text": "" }));
                }
                out.push(json!({ "role": "assistant", "content": blocks }));
            }
            ChatMessage::Tool { call_id, content } => {
                out.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": call_id,
                        "content": content,
                    }]
                }));
            }
        }
    }
    out
}

/// Data URLs become base64 source blocks; anything else is sent as a URL.
fn image_block(url: &str) -> Value {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((meta, b64)) = rest.split_once(',') {
            let mime = meta.strip_suffix(";base64").unwrap_or(meta);
            return json!({
                "type": "image",
                "source": { "type": "base64", "media_type": mime, "data": b64 }
            });
        }
    }
    json!({ "type": "image", "source": { "type": "url", "url": url } })
}

// ─── Stream event parsing ─────────────────────────────────────────────────────

pub(crate) fn parse_stream_event(v: &Value) -> ResponseEvent {
    match v["type"].as_str().unwrap_or("") {
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let block = &v["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                ResponseEvent::ToolCall {
                    index,
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    arguments: String::new(),
                }
            } else {
                ResponseEvent::TextDelta(String::new())
            }
        }
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    ResponseEvent::TextDelta(delta["text"].as_str().unwrap_or("").to_string())
                }
                "input_json_delta" => ResponseEvent::ToolCall {
                    index,
                    id: String::new(),
                    name: String::new(),
                    arguments: delta["partial_json"].as_str().unwrap_or("").to_string(),
                },
                // Extended thinking streams the chain-of-thought as a separate
                // delta type; it must never be mixed into the answer text.
                "thinking_delta" => {
                    let t = delta["thinking"].as_str().unwrap_or("");
                    if t.is_empty() {
                        ResponseEvent::TextDelta(String::new())
                    } else {
                        ResponseEvent::ThinkingDelta(t.to_string())
                    }
                }
                // Encrypted integrity blob terminating a thinking block; not
                // human-readable, silently discarded.
                "signature_delta" => ResponseEvent::TextDelta(String::new()),
                _ => ResponseEvent::TextDelta(String::new()),
            }
        }
        "message_start" => {
            if let Some(usage) = v["message"].get("usage") {
                return ResponseEvent::Usage {
                    input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                    output_tokens: 0,
                };
            }
            ResponseEvent::TextDelta(String::new())
        }
        "message_delta" => {
            if v["delta"]["stop_reason"].as_str() == Some("max_tokens") {
                return ResponseEvent::MaxTokens;
            }
            if let Some(usage) = v.get("usage") {
                return ResponseEvent::Usage {
                    input_tokens: 0,
                    output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
                };
            }
            ResponseEvent::TextDelta(String::new())
        }
        "message_stop" => ResponseEvent::Done,
        _ => ResponseEvent::TextDelta(String::new()),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
