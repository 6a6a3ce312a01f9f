// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! System-prompt assembly.
//!
//! Renders the agent's ordered prompt sections with simple `{{ name }}`
//! substitution — no code execution, no conditionals.  The assembled result
//! is frozen on the conversation as `system_prompt_snapshot` by the turn
//! processor; this module is pure.

use std::collections::HashMap;

use chrono::Utc;
use thiserror::Error;

use crate::agent::AgentProfile;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("missing required template variable: {0}")]
    MissingVariable(String),
    #[error("unterminated placeholder in template {0:?}")]
    UnterminatedPlaceholder(String),
}

/// Assemble the system prompt for an agent.
///
/// Variable priority (lowest → highest): built-in context → agent
/// `context_variables` → template `default_values` → per-reference
/// `variable_overrides`.  Sections are joined with one blank line.
pub fn assemble(profile: &AgentProfile) -> Result<String, PromptError> {
    let builtins = builtin_context(profile);
    let mut sections = Vec::with_capacity(profile.prompts.len());

    for prompt_ref in &profile.prompts {
        let mut vars: HashMap<&str, &str> = HashMap::new();
        for (k, v) in &builtins {
            vars.insert(k.as_str(), v.as_str());
        }
        for (k, v) in &profile.context_variables {
            vars.insert(k.as_str(), v.as_str());
        }
        for (k, v) in &prompt_ref.template.default_values {
            vars.insert(k.as_str(), v.as_str());
        }
        for (k, v) in &prompt_ref.variable_overrides {
            vars.insert(k.as_str(), v.as_str());
        }
        sections.push(render(&prompt_ref.template.template, &vars)?);
    }

    Ok(sections.join("\n\n"))
}

fn builtin_context(profile: &AgentProfile) -> Vec<(String, String)> {
    let now = Utc::now();
    vec![
        ("current_date".into(), now.format("%Y-%m-%d").to_string()),
        ("current_time".into(), now.format("%H:%M:%S").to_string()),
        (
            "current_datetime".into(),
            now.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        ),
        ("agent_name".into(), profile.name.clone()),
        ("agent_description".into(), profile.description.clone()),
    ]
}

/// Substitute `{{ name }}` placeholders.  Whitespace inside the braces is
/// tolerated; an unresolvable name fails the whole assembly.
fn render(template: &str, vars: &HashMap<&str, &str>) -> Result<String, PromptError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(PromptError::UnterminatedPlaceholder(
                template.chars().take(40).collect(),
            ));
        };
        let name = after[..end].trim();
        match vars.get(name) {
            Some(value) => out.push_str(value),
            None => return Err(PromptError::MissingVariable(name.to_string())),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
