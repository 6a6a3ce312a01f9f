// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use colloquy_model::ModelOverrides;

use crate::context::ContextStrategy;

fn default_context_threshold() -> f32 {
    0.85
}
fn default_max_turns() -> u32 {
    50
}

/// A reusable system-prompt template with `{{ name }}` placeholders.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub name: String,
    pub template: String,
    /// Fallback values for placeholders the agent does not supply.
    #[serde(default)]
    pub default_values: HashMap<String, String>,
}

/// An ordered reference from an agent to a prompt template, with
/// per-reference variable overrides (the highest-priority layer).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptRef {
    pub template: PromptTemplate,
    #[serde(default)]
    pub variable_overrides: HashMap<String, String>,
}

/// The frozen agent definition a turn reads.
///
/// Loaded in one batch with its prompt templates and tool names; the turn
/// processor treats it as read-only for the duration of the turn, and the
/// conversation's snapshots preserve the first turn's decisions beyond that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Backend driver key (`ollama`, `openai`, `anthropic`, ...).
    pub backend: String,
    /// Sparse model overrides layered over the backend's global settings.
    #[serde(default)]
    pub model: ModelOverrides,
    #[serde(default)]
    pub context_strategy: ContextStrategy,
    /// Fraction of the context window at which filtering triggers.
    #[serde(default = "default_context_threshold")]
    pub context_threshold: f32,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Ordered prompt sections assembled into the system prompt.
    #[serde(default)]
    pub prompts: Vec<PromptRef>,
    /// Agent-level template variables.
    #[serde(default)]
    pub context_variables: HashMap<String, String>,
    /// Server tools enabled for this agent (registry names).
    #[serde(default)]
    pub tools: Vec<String>,
}

impl AgentProfile {
    /// Minimal profile for tests and defaults.
    pub fn new(id: impl Into<String>, name: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            backend: backend.into(),
            model: ModelOverrides::default(),
            context_strategy: ContextStrategy::default(),
            context_threshold: default_context_threshold(),
            max_turns: default_max_turns(),
            prompts: Vec::new(),
            context_variables: HashMap::new(),
            tools: Vec::new(),
        }
    }
}
