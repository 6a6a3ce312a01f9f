// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use colloquy_config::ToolsConfig;
use colloquy_model::ToolSchema;

use crate::builtin::{
    document_search::DocumentSearchTool, task_list::TaskListTool, web_fetch::WebFetchTool,
    web_search::WebSearchTool,
};
use crate::Tool;

/// Central registry holding all server-side tools.
///
/// Tools are immutable after registration; the registry is shared across
/// worker tasks behind an `Arc`.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registry pre-populated with every built-in tool.
    pub fn with_builtins(cfg: &ToolsConfig) -> Self {
        let mut r = Self::new();
        r.register(WebSearchTool::new(cfg.web_search_max_results));
        r.register(WebFetchTool::new(cfg.web_fetch_max_chars));
        r.register(DocumentSearchTool::new(cfg.document_dir.clone()));
        r.register(TaskListTool::default());
        r
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_system(&self, name: &str) -> bool {
        self.tools.get(name).map(|t| t.is_system()).unwrap_or(false)
    }

    /// Schemas for all registered tools, name-sorted for stable request bodies.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_builtins(&ToolsConfig::default())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
