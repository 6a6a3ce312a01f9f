// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Per-driver backend settings keyed by driver id (`ollama`, `openai`,
    /// `anthropic`, `vllm`, `huggingface`, `fake`).
    ///
    /// ```yaml
    /// backends:
    ///   ollama:
    ///     base_url: http://localhost:11434
    ///     model: llama3.2
    ///   anthropic:
    ///     api_key_env: ANTHROPIC_API_KEY
    ///     model: claude-sonnet-4-20250514
    ///     timeout_secs: 120
    /// ```
    #[serde(default)]
    pub backends: HashMap<String, BackendSettings>,
    #[serde(default)]
    pub tools: ToolsConfig,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8420".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Directory of agent-profile YAML files loaded at start-up.  Agent CRUD
    /// itself lives outside the engine.
    #[serde(default)]
    pub agents_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            agents_dir: None,
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_turn_timeout_secs() -> u64 {
    // Per-turn wall clock. Must stay comfortably above the slowest driver
    // timeout; the queue enforces a 600 s floor regardless of this value.
    900
}
fn default_event_ttl_secs() -> u64 {
    3600
}
fn default_event_pop_timeout_ms() -> u64 {
    2000
}
fn default_token_safety_margin() -> f32 {
    0.9
}
fn default_tool_output_token_cap() -> usize {
    4000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of parallel turn workers.  Each worker processes one
    /// conversation turn at a time; distinct conversations run in parallel.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-turn wall-clock timeout in seconds.  An exceeded turn transitions
    /// the conversation to `failed("timeout")`.
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
    /// How long undelivered conversation events stay in the queue.
    #[serde(default = "default_event_ttl_secs")]
    pub event_ttl_secs: u64,
    /// Blocking-pop timeout used by the streaming endpoint; every miss emits
    /// a heartbeat, so this is also the heartbeat cadence.
    #[serde(default = "default_event_pop_timeout_ms")]
    pub event_pop_timeout_ms: u64,
    /// Global safety margin applied to token-budget computations (0.0–1.0).
    /// Shrinks the computed budget so conservative estimates never overflow
    /// the real context window.
    #[serde(default = "default_token_safety_margin")]
    pub token_safety_margin: f32,
    /// Maximum tokens a single tool result may occupy before it is truncated
    /// at a line boundary with an omission notice.  0 disables capping.
    #[serde(default = "default_tool_output_token_cap")]
    pub tool_output_token_cap: usize,
    /// Override for the summarization-strategy prompt.  Leave unset to use
    /// the built-in prompt.
    #[serde(default)]
    pub summarization_prompt: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            turn_timeout_secs: default_turn_timeout_secs(),
            event_ttl_secs: default_event_ttl_secs(),
            event_pop_timeout_ms: default_event_pop_timeout_ms(),
            token_safety_margin: default_token_safety_margin(),
            tool_output_token_cap: default_tool_output_token_cap(),
            summarization_prompt: None,
        }
    }
}

/// Settings for one backend driver.  Every field is optional; the driver
/// registry supplies defaults (base URL, API-key env var) and the model
/// catalog supplies per-model ceilings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Base URL override.  Useful for local proxies or self-hosted servers.
    pub base_url: Option<String>,
    /// Explicit API key; prefer `api_key_env` in version-controlled files.
    pub api_key: Option<String>,
    /// Environment variable holding the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Default model when the agent does not specify one.
    pub model: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Sampling temperature (0.0–2.0).
    pub temperature: Option<f32>,
    /// Maximum tokens to request in a single completion.
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    /// Context window override.  Clamped to the catalog ceiling when the
    /// model is known.
    pub context_length: Option<u32>,
    /// Free-form driver-specific options merged verbatim into request bodies.
    #[serde(default)]
    pub extra: serde_json::Value,
}

fn default_web_search_max_results() -> usize {
    5
}
fn default_web_fetch_max_chars() -> usize {
    50_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Directory searched by the `document_search` tool.
    #[serde(default)]
    pub document_dir: Option<PathBuf>,
    #[serde(default = "default_web_search_max_results")]
    pub web_search_max_results: usize,
    #[serde(default = "default_web_fetch_max_chars")]
    pub web_fetch_max_chars: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            document_dir: None,
            web_search_max_results: default_web_search_max_results(),
            web_fetch_max_chars: default_web_fetch_max_chars(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
