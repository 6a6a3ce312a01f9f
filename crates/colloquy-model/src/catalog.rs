// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Static model catalog: context windows and output ceilings for well-known
//! models.  Used for ceiling clamps during model-config normalization and as
//! the default `context_limit` source for drivers.

#[derive(Debug, Clone)]
pub struct ModelCatalogEntry {
    pub id: &'static str,
    pub provider: &'static str,
    pub context_window: usize,
    pub max_output_tokens: u32,
}

static CATALOG: &[ModelCatalogEntry] = &[
    // ── OpenAI ────────────────────────────────────────────────────────────────
    ModelCatalogEntry { id: "gpt-4o", provider: "openai", context_window: 128_000, max_output_tokens: 16_384 },
    ModelCatalogEntry { id: "gpt-4o-mini", provider: "openai", context_window: 128_000, max_output_tokens: 16_384 },
    ModelCatalogEntry { id: "gpt-4.1", provider: "openai", context_window: 1_047_576, max_output_tokens: 32_768 },
    ModelCatalogEntry { id: "gpt-4.1-mini", provider: "openai", context_window: 1_047_576, max_output_tokens: 32_768 },
    // ── Anthropic ─────────────────────────────────────────────────────────────
    ModelCatalogEntry { id: "claude-sonnet-4-20250514", provider: "anthropic", context_window: 200_000, max_output_tokens: 64_000 },
    ModelCatalogEntry { id: "claude-opus-4-20250514", provider: "anthropic", context_window: 200_000, max_output_tokens: 32_000 },
    ModelCatalogEntry { id: "claude-3-5-haiku-20241022", provider: "anthropic", context_window: 200_000, max_output_tokens: 8_192 },
    // ── Local / OSS (Ollama and vLLM host the same weights) ──────────────────
    ModelCatalogEntry { id: "llama3.2", provider: "ollama", context_window: 131_072, max_output_tokens: 4_096 },
    ModelCatalogEntry { id: "llama3.1", provider: "ollama", context_window: 131_072, max_output_tokens: 4_096 },
    ModelCatalogEntry { id: "qwen2.5", provider: "ollama", context_window: 32_768, max_output_tokens: 8_192 },
    ModelCatalogEntry { id: "mistral", provider: "ollama", context_window: 32_768, max_output_tokens: 4_096 },
    ModelCatalogEntry { id: "meta-llama/Llama-3.1-8B-Instruct", provider: "vllm", context_window: 131_072, max_output_tokens: 4_096 },
    ModelCatalogEntry { id: "Qwen/Qwen2.5-7B-Instruct", provider: "vllm", context_window: 32_768, max_output_tokens: 8_192 },
    ModelCatalogEntry { id: "meta-llama/Llama-3.1-8B-Instruct", provider: "huggingface", context_window: 131_072, max_output_tokens: 4_096 },
];

/// Look up a catalog entry by provider and model id.
pub fn lookup(provider: &str, model: &str) -> Option<&'static ModelCatalogEntry> {
    CATALOG
        .iter()
        .find(|e| e.provider == provider && e.id == model)
}

/// All catalog entries for a provider.
pub fn for_provider(provider: &str) -> Vec<&'static ModelCatalogEntry> {
    CATALOG.iter().filter(|e| e.provider == provider).collect()
}
