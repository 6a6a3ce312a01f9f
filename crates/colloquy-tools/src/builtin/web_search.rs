// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use colloquy_model::ToolResult;

use crate::Tool;

pub struct WebSearchTool {
    max_results: usize,
}

impl WebSearchTool {
    pub fn new(max_results: usize) -> Self {
        Self { max_results }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Real-time web search. Requires BRAVE_API_KEY env var.\n\
         Include the current year in queries for recent info (e.g., 'Go release 2026').\n\
         ALWAYS cite sources after answering:\n\
         Sources:\n\
         - [Title](URL)"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query"
                },
                "count": {
                    "type": "integer",
                    "description": "Number of results to return (default 5, max 10)"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    fn timeout_secs(&self) -> u64 {
        20
    }

    async fn execute(&self, arguments: &Value) -> ToolResult {
        let query = match arguments.get("query").and_then(|v| v.as_str()) {
            Some(q) => q.to_string(),
            None => return ToolResult::failure("missing 'query'"),
        };
        let count = arguments
            .get("count")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.max_results as u64)
            .min(10) as usize;

        debug!(query = %query, count, "web_search tool");

        let Some(api_key) = std::env::var("BRAVE_API_KEY").ok() else {
            return ToolResult::failure(
                "No search API key configured. Set the BRAVE_API_KEY environment variable.",
            );
        };

        match brave_search(&query, count, &api_key).await {
            Ok(results) => ToolResult::success(results),
            Err(e) => ToolResult::failure(format!("search error: {e}")),
        }
    }
}

async fn brave_search(query: &str, count: usize, api_key: &str) -> anyhow::Result<String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .user_agent("colloquy-engine/0.1")
        .build()?;

    let url = format!(
        "https://api.search.brave.com/res/v1/web/search?q={}&count={}",
        urlencode(query),
        count
    );

    let resp = client
        .get(&url)
        .header("Accept", "application/json")
        .header("X-Subscription-Token", api_key)
        .send()
        .await?;

    if !resp.status().is_success() {
        anyhow::bail!("search API returned status {}", resp.status());
    }

    let body: Value = resp.json().await?;
    let results = body
        .get("web")
        .and_then(|w| w.get("results"))
        .and_then(|r| r.as_array())
        .map(|arr| arr.as_slice())
        .unwrap_or(&[]);

    if results.is_empty() {
        return Ok(format!("No results for: {query}"));
    }

    let mut out = String::new();
    for (i, r) in results.iter().take(count).enumerate() {
        let title = r["title"].as_str().unwrap_or("(untitled)");
        let url = r["url"].as_str().unwrap_or("");
        let snippet = r["description"].as_str().unwrap_or("");
        out.push_str(&format!("{}. {title}\n   {url}\n   {snippet}\n", i + 1));
    }
    Ok(out)
}

/// Percent-encode the characters that matter in a query component.
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
