// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context-window management.
//!
//! Reduces the transmitted message history to fit the model's context window.
//! Every strategy preserves the same invariants: the system prompt survives,
//! pinned messages survive, and a tool-call/tool-result pair is kept or
//! dropped as one atomic unit.
//!
//! The filter fails open: when strategy resolution or a summarization call
//! fails, all messages pass through and overflow becomes the driver's
//! problem.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use colloquy_model::{BackendDriver, BackendError, ChatMessage, CompletionRequest, Role};

use crate::conversation::MessageEntry;

const DEFAULT_SUMMARIZATION_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve all technical details, decisions, names, \
     and tool outputs that may be relevant to future work. The summary will replace the \
     original history to free up context space.";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ContextStrategy {
    #[default]
    Noop,
    SlidingWindow {
        window_size: usize,
    },
    TokenBudget {
        budget_percentage: f32,
        #[serde(default)]
        reserve_tokens: usize,
    },
    Summarization {
        target_tokens: usize,
        min_messages: usize,
    },
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid context strategy configuration: {0}")]
    InvalidConfig(String),
    #[error("summarization call failed: {0}")]
    Summarization(#[from] BackendError),
}

/// Per-turn token accounting the filter needs besides the messages.
#[derive(Debug, Clone, Copy)]
pub struct FilterParams {
    pub system_prompt_tokens: usize,
    pub tool_schema_tokens: usize,
    pub context_limit: usize,
    pub max_output_tokens: usize,
}

pub struct ContextFilter {
    safety_margin: f32,
    summarization_prompt: String,
}

impl Default for ContextFilter {
    fn default() -> Self {
        Self::new(0.9, None)
    }
}

impl ContextFilter {
    pub fn new(safety_margin: f32, summarization_prompt: Option<String>) -> Self {
        Self {
            safety_margin: safety_margin.clamp(0.1, 1.0),
            summarization_prompt: summarization_prompt
                .unwrap_or_else(|| DEFAULT_SUMMARIZATION_PROMPT.to_string()),
        }
    }

    /// The triggering rule: filter only when the estimated total exceeds
    /// `threshold × context_limit`.
    pub fn should_trigger(
        &self,
        entries: &[MessageEntry],
        params: FilterParams,
        threshold: f32,
    ) -> bool {
        let total = transcript_tokens(entries)
            + params.system_prompt_tokens
            + params.tool_schema_tokens;
        total as f32 > threshold * params.context_limit as f32
    }

    /// Apply the strategy, failing open on any resolution error.
    pub async fn filter(
        &self,
        entries: Vec<MessageEntry>,
        strategy: &ContextStrategy,
        params: FilterParams,
        driver: &dyn BackendDriver,
    ) -> Vec<MessageEntry> {
        match self.apply(entries.clone(), strategy, params, driver).await {
            Ok(filtered) => filtered,
            Err(e) => {
                warn!(error = %e, "context filter resolution failed; passing all messages through");
                entries
            }
        }
    }

    async fn apply(
        &self,
        entries: Vec<MessageEntry>,
        strategy: &ContextStrategy,
        params: FilterParams,
        driver: &dyn BackendDriver,
    ) -> Result<Vec<MessageEntry>, FilterError> {
        match strategy {
            ContextStrategy::Noop => Ok(entries),
            ContextStrategy::SlidingWindow { window_size } => {
                if *window_size == 0 {
                    return Err(FilterError::InvalidConfig("window_size must be > 0".into()));
                }
                Ok(sliding_window(entries, *window_size))
            }
            ContextStrategy::TokenBudget {
                budget_percentage,
                reserve_tokens,
            } => {
                if !(*budget_percentage > 0.0 && *budget_percentage <= 1.0) {
                    return Err(FilterError::InvalidConfig(
                        "budget_percentage must be in (0, 1]".into(),
                    ));
                }
                Ok(self.token_budget(entries, *budget_percentage, *reserve_tokens, params))
            }
            ContextStrategy::Summarization {
                target_tokens,
                min_messages,
            } => {
                if *min_messages == 0 {
                    return Err(FilterError::InvalidConfig("min_messages must be > 0".into()));
                }
                self.summarize(entries, *target_tokens, *min_messages, params, driver)
                    .await
            }
        }
    }

    /// Walk newest → oldest, admitting units that fit the remaining budget.
    /// Pinned and system units are always admitted.
    fn token_budget(
        &self,
        entries: Vec<MessageEntry>,
        budget_percentage: f32,
        reserve_tokens: usize,
        params: FilterParams,
    ) -> Vec<MessageEntry> {
        let base = params
            .context_limit
            .saturating_sub(params.max_output_tokens)
            .saturating_sub(params.tool_schema_tokens)
            .saturating_sub(params.system_prompt_tokens);
        let available = ((base as f32 * budget_percentage * self.safety_margin) as usize)
            .saturating_sub(reserve_tokens);

        let units = group_units(entries);
        let mut remaining = available;
        let mut admitted: Vec<Unit> = Vec::new();
        for unit in units.into_iter().rev() {
            if unit.must_keep() {
                remaining = remaining.saturating_sub(unit.tokens);
                admitted.push(unit);
            } else if unit.tokens <= remaining {
                remaining -= unit.tokens;
                admitted.push(unit);
            }
        }
        admitted.reverse();
        flatten(admitted)
    }

    /// Collapse the oldest contiguous non-pinned block into one synthetic
    /// system summary, repeating until the transcript fits the usable budget
    /// or too few messages remain ahead of the tail.  The summarization call
    /// itself bypasses the filter.
    async fn summarize(
        &self,
        entries: Vec<MessageEntry>,
        target_tokens: usize,
        min_messages: usize,
        params: FilterParams,
        driver: &dyn BackendDriver,
    ) -> Result<Vec<MessageEntry>, FilterError> {
        let budget = ((params
            .context_limit
            .saturating_sub(params.max_output_tokens)
            .saturating_sub(params.tool_schema_tokens)
            .saturating_sub(params.system_prompt_tokens)) as f32
            * self.safety_margin) as usize;

        let mut units = group_units(entries);
        loop {
            let total: usize = units.iter().map(|u| u.tokens).sum();
            if total <= budget {
                break;
            }
            // Oldest contiguous run of droppable units.  Pinned and system
            // units (earlier summaries included) are skipped, and the newest
            // unit always stays as the tail.
            let mut start = 0;
            while start < units.len() && units[start].must_keep() {
                start += 1;
            }
            let mut end = start;
            let mut block_messages = 0;
            while end + 1 < units.len() && !units[end].must_keep() {
                block_messages += units[end].entries.len();
                end += 1;
            }
            if block_messages < min_messages {
                break;
            }

            let block: Vec<Unit> = units.drain(start..end).collect();
            let history = serialize_units(&block);
            let request = CompletionRequest {
                system: String::new(),
                messages: vec![ChatMessage::user(format!(
                    "{}\n\nKeep the summary under {target_tokens} tokens.\n\n---\n\n{history}",
                    self.summarization_prompt
                ))],
                tools: vec![],
            };
            let response = driver.execute(request).await?;
            let mut summary = response.content;
            // Hard cap as enforcement; the prompt alone is advisory.
            let cap_chars = target_tokens * 4;
            if summary.len() > cap_chars {
                summary.truncate(floor_char_boundary(&summary, cap_chars));
            }
            let entry = MessageEntry::new(ChatMessage::system(format!(
                "[Summary of earlier conversation]\n{summary}"
            )));
            units.insert(start, Unit::single(entry));
        }
        Ok(flatten(units))
    }
}

/// Total estimated tokens for a transcript slice.
pub fn transcript_tokens(entries: &[MessageEntry]) -> usize {
    entries.iter().map(|e| e.tokens_estimate() as usize).sum()
}

fn floor_char_boundary(text: &str, mut i: usize) -> usize {
    if i >= text.len() {
        return text.len();
    }
    while i > 0 && !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

// ─── Atomic units ─────────────────────────────────────────────────────────────

/// One indivisible slice of the transcript: either a single message, or an
/// assistant tool-call message together with its tool-result messages.
struct Unit {
    entries: Vec<MessageEntry>,
    pinned: bool,
    is_system: bool,
    tokens: usize,
}

impl Unit {
    fn single(entry: MessageEntry) -> Self {
        let pinned = entry.pinned;
        let is_system = entry.message.role() == Role::System;
        let tokens = entry.tokens_estimate() as usize;
        Self {
            entries: vec![entry],
            pinned,
            is_system,
            tokens,
        }
    }

    fn push(&mut self, entry: MessageEntry) {
        self.pinned |= entry.pinned;
        self.tokens += entry.tokens_estimate() as usize;
        self.entries.push(entry);
    }

    fn must_keep(&self) -> bool {
        self.pinned || self.is_system
    }
}

/// Group a transcript into atomic units.  Tool-result messages join the unit
/// of the assistant message that issued their call id; an orphan tool result
/// (its call already gone) forms its own droppable unit.
fn group_units(entries: Vec<MessageEntry>) -> Vec<Unit> {
    let mut units: Vec<Unit> = Vec::new();
    let mut open_call_ids: Vec<String> = Vec::new();

    for entry in entries {
        match &entry.message {
            ChatMessage::Assistant { tool_calls, .. } if !tool_calls.is_empty() => {
                open_call_ids = tool_calls.iter().map(|tc| tc.id.clone()).collect();
                units.push(Unit::single(entry));
            }
            ChatMessage::Tool { call_id, .. }
                if open_call_ids.iter().any(|id| id == call_id) =>
            {
                units
                    .last_mut()
                    .expect("open call ids imply a preceding unit")
                    .push(entry);
            }
            _ => {
                open_call_ids.clear();
                units.push(Unit::single(entry));
            }
        }
    }
    units
}

fn flatten(units: Vec<Unit>) -> Vec<MessageEntry> {
    units.into_iter().flat_map(|u| u.entries).collect()
}

/// Keep the `window_size − 1` most recent messages (expanded to unit
/// boundaries) plus every pinned or system unit.
fn sliding_window(entries: Vec<MessageEntry>, window_size: usize) -> Vec<MessageEntry> {
    let units = group_units(entries);
    let keep_messages = window_size.saturating_sub(1);

    let mut kept = 0usize;
    let mut admitted: Vec<Unit> = Vec::new();
    for unit in units.into_iter().rev() {
        if kept < keep_messages || unit.must_keep() {
            kept += unit.entries.len();
            admitted.push(unit);
        }
    }
    admitted.reverse();
    flatten(admitted)
}

fn serialize_units(units: &[Unit]) -> String {
    let mut lines = Vec::new();
    for unit in units {
        for entry in &unit.entries {
            let role = match entry.message.role() {
                Role::System => "System",
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
            };
            let mut text = entry.message.content().to_string();
            for tc in entry.message.tool_calls() {
                text.push_str(&format!(" [tool_call: {}({})]", tc.name, tc.arguments));
            }
            lines.push(format!("{role}: {text}"));
        }
    }
    lines.join("\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_model::{FakeDriver, ToolCall};
    use serde_json::json;

    fn entry(m: ChatMessage) -> MessageEntry {
        let mut e = MessageEntry::new(m);
        e.tokens();
        e
    }

    fn pinned(m: ChatMessage) -> MessageEntry {
        let mut e = entry(m);
        e.pinned = true;
        e
    }

    fn params(limit: usize, max_out: usize) -> FilterParams {
        FilterParams {
            system_prompt_tokens: 0,
            tool_schema_tokens: 0,
            context_limit: limit,
            max_output_tokens: max_out,
        }
    }

    fn tool_pair() -> Vec<MessageEntry> {
        vec![
            entry(ChatMessage::assistant_with_tools(
                "",
                vec![ToolCall::new("call_0", "web_search", json!({"query": "x"}))],
                None,
            )),
            entry(ChatMessage::tool("call_0", "results")),
        ]
    }

    fn filter() -> ContextFilter {
        ContextFilter::default()
    }

    // ── Triggering ────────────────────────────────────────────────────────────

    #[test]
    fn trigger_fires_only_above_threshold() {
        let f = filter();
        let small = vec![entry(ChatMessage::user("short"))];
        assert!(!f.should_trigger(&small, params(1000, 0), 0.8));
        let big = vec![entry(ChatMessage::user(&"x".repeat(4000)))];
        assert!(f.should_trigger(&big, params(1000, 0), 0.8));
    }

    // ── Noop ──────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn noop_passes_everything_through() {
        let f = filter();
        let entries = vec![entry(ChatMessage::user("a")), entry(ChatMessage::assistant("b"))];
        let driver = FakeDriver::default();
        let out = f
            .filter(entries.clone(), &ContextStrategy::Noop, params(100, 0), &driver)
            .await;
        assert_eq!(out.len(), entries.len());
    }

    // ── Sliding window ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn sliding_window_keeps_most_recent() {
        let f = filter();
        let entries: Vec<MessageEntry> = (0..10)
            .map(|i| entry(ChatMessage::user(format!("message {i}"))))
            .collect();
        let driver = FakeDriver::default();
        let out = f
            .filter(
                entries,
                &ContextStrategy::SlidingWindow { window_size: 4 },
                params(1000, 0),
                &driver,
            )
            .await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].message.content(), "message 7");
        assert_eq!(out[2].message.content(), "message 9");
    }

    #[tokio::test]
    async fn sliding_window_never_drops_pinned() {
        let f = filter();
        let mut entries = vec![pinned(ChatMessage::user("pinned instructions"))];
        entries.extend((0..10).map(|i| entry(ChatMessage::user(format!("m{i}")))));
        let driver = FakeDriver::default();
        let out = f
            .filter(
                entries,
                &ContextStrategy::SlidingWindow { window_size: 3 },
                params(1000, 0),
                &driver,
            )
            .await;
        assert!(out.iter().any(|e| e.message.content() == "pinned instructions"));
    }

    #[tokio::test]
    async fn sliding_window_zero_fails_open() {
        let f = filter();
        let entries: Vec<MessageEntry> =
            (0..5).map(|i| entry(ChatMessage::user(format!("m{i}")))).collect();
        let driver = FakeDriver::default();
        let out = f
            .filter(
                entries.clone(),
                &ContextStrategy::SlidingWindow { window_size: 0 },
                params(1000, 0),
                &driver,
            )
            .await;
        assert_eq!(out.len(), entries.len(), "invalid config must fail open");
    }

    #[tokio::test]
    async fn sliding_window_does_not_split_tool_pairs() {
        let f = filter();
        let mut entries = vec![entry(ChatMessage::user("old"))];
        entries.extend(tool_pair());
        entries.push(entry(ChatMessage::assistant("final")));
        let driver = FakeDriver::default();
        let out = f
            .filter(
                entries,
                // window_size 3 keeps 2 messages: "final" plus part of the
                // pair — which must expand to the whole pair.
                &ContextStrategy::SlidingWindow { window_size: 3 },
                params(1000, 0),
                &driver,
            )
            .await;
        assert_pairs_intact(&out);
        assert!(out.iter().any(|e| e.message.content() == "final"));
    }

    // ── Token budget ──────────────────────────────────────────────────────────

    fn assert_pairs_intact(entries: &[MessageEntry]) {
        // Every tool message's call id must exist in a prior assistant
        // message, and every assistant call id must have its tool message.
        let mut open: Vec<String> = Vec::new();
        for e in entries {
            for tc in e.message.tool_calls() {
                open.push(tc.id.clone());
            }
            if let Some(id) = e.message.tool_call_id() {
                assert!(
                    open.iter().any(|o| o == id),
                    "orphan tool result for call {id}"
                );
            }
        }
        let answered: Vec<&str> = entries
            .iter()
            .filter_map(|e| e.message.tool_call_id())
            .collect();
        for e in entries {
            for tc in e.message.tool_calls() {
                assert!(
                    answered.contains(&tc.id.as_str()),
                    "call {} kept without its result",
                    tc.id
                );
            }
        }
    }

    #[tokio::test]
    async fn token_budget_drops_oldest_first() {
        let f = filter();
        let mut entries: Vec<MessageEntry> = (0..20)
            .map(|i| entry(ChatMessage::user(format!("padding message number {i} {}", "x".repeat(100)))))
            .collect();
        entries.push(entry(ChatMessage::user("the newest question")));
        let driver = FakeDriver::default();
        let out = f
            .filter(
                entries,
                &ContextStrategy::TokenBudget {
                    budget_percentage: 0.8,
                    reserve_tokens: 0,
                },
                params(200, 50),
                &driver,
            )
            .await;
        assert!(out.len() < 21, "some old messages must be dropped");
        assert_eq!(
            out.last().unwrap().message.content(),
            "the newest question",
            "newest messages survive"
        );
    }

    #[tokio::test]
    async fn token_budget_respects_reserve() {
        let f = filter();
        let entries: Vec<MessageEntry> = (0..10)
            .map(|i| entry(ChatMessage::user(format!("msg {i} {}", "y".repeat(100)))))
            .collect();
        let driver = FakeDriver::default();
        let strategy = |reserve| ContextStrategy::TokenBudget {
            budget_percentage: 1.0,
            reserve_tokens: reserve,
        };
        let with_reserve = f
            .filter(entries.clone(), &strategy(200), params(400, 0), &driver)
            .await;
        let without_reserve = f
            .filter(entries, &strategy(0), params(400, 0), &driver)
            .await;
        assert!(with_reserve.len() < without_reserve.len());
    }

    #[tokio::test]
    async fn token_budget_keeps_pairs_atomic() {
        let f = filter();
        let mut entries = Vec::new();
        for _ in 0..5 {
            entries.extend(tool_pair());
            entries.push(entry(ChatMessage::user(&"filler ".repeat(40))));
        }
        let driver = FakeDriver::default();
        let out = f
            .filter(
                entries,
                &ContextStrategy::TokenBudget {
                    budget_percentage: 0.5,
                    reserve_tokens: 0,
                },
                params(300, 50),
                &driver,
            )
            .await;
        assert_pairs_intact(&out);
    }

    #[tokio::test]
    async fn token_budget_always_admits_pinned() {
        let f = filter();
        let mut entries = vec![pinned(ChatMessage::user(&"pinned ".repeat(100)))];
        entries.extend((0..5).map(|i| entry(ChatMessage::user(format!("m{i}")))));
        let driver = FakeDriver::default();
        let out = f
            .filter(
                entries,
                &ContextStrategy::TokenBudget {
                    budget_percentage: 0.1,
                    reserve_tokens: 0,
                },
                params(100, 0),
                &driver,
            )
            .await;
        assert!(out.iter().any(|e| e.pinned), "pinned message must survive");
    }

    #[tokio::test]
    async fn token_budget_output_fits_property() {
        // estimated(output) + system + schema + max_output <= context_limit.
        let f = filter();
        let entries: Vec<MessageEntry> = (0..50)
            .map(|i| entry(ChatMessage::user(format!("msg {i} {}", "z".repeat(200)))))
            .collect();
        let p = FilterParams {
            system_prompt_tokens: 100,
            tool_schema_tokens: 50,
            context_limit: 2000,
            max_output_tokens: 500,
        };
        let driver = FakeDriver::default();
        let out = f
            .filter(
                entries,
                &ContextStrategy::TokenBudget {
                    budget_percentage: 1.0,
                    reserve_tokens: 0,
                },
                p,
                &driver,
            )
            .await;
        let total = transcript_tokens(&out) + p.system_prompt_tokens + p.tool_schema_tokens
            + p.max_output_tokens;
        assert!(
            total <= p.context_limit,
            "{total} tokens exceed the {} limit",
            p.context_limit
        );
    }

    #[tokio::test]
    async fn token_budget_invalid_percentage_fails_open() {
        let f = filter();
        let entries: Vec<MessageEntry> =
            (0..5).map(|i| entry(ChatMessage::user(format!("m{i}")))).collect();
        let driver = FakeDriver::default();
        let out = f
            .filter(
                entries.clone(),
                &ContextStrategy::TokenBudget {
                    budget_percentage: 1.5,
                    reserve_tokens: 0,
                },
                params(100, 0),
                &driver,
            )
            .await;
        assert_eq!(out.len(), entries.len());
    }

    // ── Summarization ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn summarization_replaces_oldest_block_with_system_summary() {
        let f = filter();
        let entries: Vec<MessageEntry> = (0..12)
            .map(|i| entry(ChatMessage::user(format!("turn {i} {}", "w".repeat(120)))))
            .collect();
        let driver = FakeDriver::always_text("the early turns discussed w-padding");
        let out = f
            .filter(
                entries,
                &ContextStrategy::Summarization {
                    target_tokens: 100,
                    min_messages: 3,
                },
                params(300, 50),
                &driver,
            )
            .await;
        assert!(out.len() < 12);
        assert_eq!(out[0].message.role(), Role::System);
        assert!(out[0].message.content().contains("early turns"));
        // The most recent message always survives as the tail.
        assert!(out.iter().any(|e| e.message.content().starts_with("turn 11")));
    }

    #[tokio::test]
    async fn summarization_stops_when_too_few_messages_remain() {
        let f = filter();
        let entries: Vec<MessageEntry> = (0..12)
            .map(|i| entry(ChatMessage::user(format!("turn {i} {}", "v".repeat(120)))))
            .collect();
        let driver = FakeDriver::default();
        // min_messages larger than the whole transcript: nothing may be
        // collapsed, so everything passes through even though it overflows.
        let out = f
            .filter(
                entries.clone(),
                &ContextStrategy::Summarization {
                    target_tokens: 50,
                    min_messages: 100,
                },
                params(200, 50),
                &driver,
            )
            .await;
        assert_eq!(out.len(), entries.len());
    }

    #[tokio::test]
    async fn summarization_respects_pinned_messages() {
        let f = filter();
        let mut entries = vec![pinned(ChatMessage::user("pinned directive"))];
        entries.extend(
            (0..10).map(|i| entry(ChatMessage::user(format!("turn {i} {}", "u".repeat(120))))),
        );
        let driver = FakeDriver::always_text("summary");
        let out = f
            .filter(
                entries,
                &ContextStrategy::Summarization {
                    target_tokens: 60,
                    min_messages: 3,
                },
                params(300, 50),
                &driver,
            )
            .await;
        assert!(out.iter().any(|e| e.message.content() == "pinned directive"));
    }

    // ── Scenario: 200K history into a 128K window ────────────────────────────

    #[tokio::test]
    async fn overflow_scenario_with_token_budget() {
        let f = filter();
        // ~200K tokens of prose history (4 chars/token).
        let mut entries: Vec<MessageEntry> = (0..100)
            .map(|i| entry(ChatMessage::user(format!("old {i} {}", "p".repeat(8000)))))
            .collect();
        entries.extend(tool_pair());
        entries.push(entry(ChatMessage::user("latest question")));
        let before = entries.len();
        let p = FilterParams {
            system_prompt_tokens: 500,
            tool_schema_tokens: 300,
            context_limit: 128_000,
            max_output_tokens: 4096,
        };
        let driver = FakeDriver::default();
        let out = f
            .filter(
                entries,
                &ContextStrategy::TokenBudget {
                    budget_percentage: 0.8,
                    reserve_tokens: 0,
                },
                p,
                &driver,
            )
            .await;
        assert!(out.len() < before, "at least one old message dropped");
        assert_pairs_intact(&out);
        assert!(out.iter().any(|e| e.message.content() == "latest question"));
        let total =
            transcript_tokens(&out) + p.system_prompt_tokens + p.tool_schema_tokens + p.max_output_tokens;
        assert!(total <= p.context_limit);
    }
}
