// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use colloquy_model::ToolResult;

use crate::Tool;

pub struct WebFetchTool {
    max_chars: usize,
}

impl WebFetchTool {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch content from a URL and convert it to readable text.\n\
         - HTTP and HTTPS URLs only\n\
         - HTML is converted to plain text; JSON is pretty-printed\n\
         - No authentication; read-only; output is size-capped"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch (http or https)"
                },
                "max_chars": {
                    "type": "integer",
                    "description": "Maximum characters to return"
                }
            },
            "required": ["url"],
            "additionalProperties": false
        })
    }

    fn timeout_secs(&self) -> u64 {
        45
    }

    async fn execute(&self, arguments: &Value) -> ToolResult {
        let url = match arguments.get("url").and_then(|v| v.as_str()) {
            Some(u) => u.to_string(),
            None => return ToolResult::failure("missing 'url'"),
        };
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return ToolResult::failure("url must be http or https");
        }
        let max_chars = arguments
            .get("max_chars")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.max_chars as u64) as usize;

        debug!(url = %url, "web_fetch tool");

        match fetch_url(&url, max_chars).await {
            Ok(content) => ToolResult::success(content),
            Err(e) => ToolResult::failure(format!("fetch error: {e}")),
        }
    }
}

async fn fetch_url(url: &str, max_chars: usize) -> anyhow::Result<String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .redirect(reqwest::redirect::Policy::limited(3))
        .user_agent("colloquy-engine/0.1")
        .build()?;

    let response = client.get(url).send().await?;
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();

    let body = response.text().await?;

    let content = if content_type.contains("html") {
        html_to_text(&body)
    } else if content_type.contains("json") {
        match serde_json::from_str::<Value>(&body) {
            Ok(v) => serde_json::to_string_pretty(&v).unwrap_or(body),
            Err(_) => body,
        }
    } else {
        body
    };

    if content.len() > max_chars {
        Ok(format!(
            "{}...[truncated at {max_chars} chars; total {} chars]",
            &content[..max_chars],
            content.len()
        ))
    } else {
        Ok(content)
    }
}

fn html_to_text(html: &str) -> String {
    html2text::from_read(html.as_bytes(), 100)
}
