// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use colloquy_model::ToolResult;

use crate::Tool;

const MAX_MATCHES: usize = 20;
const CONTEXT_CHARS: usize = 160;

/// Case-insensitive search over the configured document directory.
///
/// Stands in for a full retrieval pipeline: the engine only needs a
/// prompt-augmentation hook, not ingestion or embeddings.
pub struct DocumentSearchTool {
    document_dir: Option<PathBuf>,
}

impl DocumentSearchTool {
    pub fn new(document_dir: Option<PathBuf>) -> Self {
        Self { document_dir }
    }
}

#[async_trait]
impl Tool for DocumentSearchTool {
    fn name(&self) -> &str {
        "document_search"
    }

    fn description(&self) -> &str {
        "Search the platform's document store for passages matching a query.\n\
         Returns matching snippets with their source file names."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Text to search for (case-insensitive)"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    fn timeout_secs(&self) -> u64 {
        15
    }

    async fn execute(&self, arguments: &Value) -> ToolResult {
        let query = match arguments.get("query").and_then(|v| v.as_str()) {
            Some(q) if !q.trim().is_empty() => q.to_lowercase(),
            _ => return ToolResult::failure("missing 'query'"),
        };
        let Some(dir) = &self.document_dir else {
            return ToolResult::failure("no document directory configured");
        };

        debug!(query = %query, dir = %dir.display(), "document_search tool");

        // Blocking directory walk off the async executor.
        let dir = dir.clone();
        match tokio_blocking_search(dir, query).await {
            Ok(out) => ToolResult::success(out),
            Err(e) => ToolResult::failure(format!("search error: {e}")),
        }
    }
}

async fn tokio_blocking_search(dir: PathBuf, query: String) -> anyhow::Result<String> {
    tokio::task::spawn_blocking(move || search_dir(&dir, &query))
        .await
        .map_err(|e| anyhow::anyhow!("search task panicked: {e}"))?
}

fn search_dir(dir: &Path, query: &str) -> anyhow::Result<String> {
    if !dir.is_dir() {
        anyhow::bail!("document directory {} does not exist", dir.display());
    }
    let mut matches = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue; // binary or unreadable; skip
        };
        let lower = text.to_lowercase();
        let mut from = 0;
        while let Some(pos) = lower[from..].find(query) {
            let at = from + pos;
            matches.push(snippet(&path, &text, at));
            from = at + query.len();
            if matches.len() >= MAX_MATCHES {
                break;
            }
        }
        if matches.len() >= MAX_MATCHES {
            break;
        }
    }
    if matches.is_empty() {
        return Ok(format!("No documents match: {query}"));
    }
    Ok(matches.join("\n---\n"))
}

fn snippet(path: &Path, text: &str, at: usize) -> String {
    let start = text
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= at.saturating_sub(CONTEXT_CHARS / 2))
        .last()
        .unwrap_or(0);
    let end = (at + CONTEXT_CHARS / 2).min(text.len());
    // Snap to char boundaries so slicing never panics on multibyte input.
    let start = floor_char_boundary(text, start);
    let end = floor_char_boundary(text, end);
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("?");
    format!("[{name}] …{}…", text[start..end].trim())
}

fn floor_char_boundary(text: &str, mut i: usize) -> usize {
    while i > 0 && !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}
