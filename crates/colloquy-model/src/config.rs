// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use colloquy_config::BackendSettings;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{catalog, error::BackendError, registry};

const DEFAULT_TEMPERATURE: f32 = 0.2;
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Sparse per-agent model overrides.  Every field is optional; unset fields
/// fall through to the global backend settings and then driver defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOverrides {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub context_length: Option<u32>,
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Fully resolved model configuration for one turn.
///
/// Produced by [`normalize`]; persisted on the conversation as the
/// `model_config_snapshot` so later agent edits never affect in-flight
/// conversations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedModelConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    pub context_length: usize,
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Resolve the effective model configuration for a driver.
///
/// Resolution order (lowest → highest): driver defaults → global backend
/// settings → agent overrides → model-ceiling clamps.  Parameters the driver
/// does not support are dropped and surfaced as warnings rather than being
/// forwarded and rejected by the provider.
pub fn normalize(
    driver: &str,
    settings: &BackendSettings,
    overrides: &ModelOverrides,
) -> Result<(NormalizedModelConfig, Vec<String>), BackendError> {
    let meta = registry::get_driver(driver)
        .ok_or_else(|| unknown_driver_error(driver))?;

    let mut warnings = Vec::new();

    let model = overrides
        .model
        .clone()
        .or_else(|| settings.model.clone())
        .ok_or_else(|| {
            BackendError::ModelNotFound(format!("no model configured for driver {driver}"))
        })?;

    let temperature = overrides
        .temperature
        .or(settings.temperature)
        .unwrap_or(DEFAULT_TEMPERATURE);
    let top_p = overrides.top_p.or(settings.top_p);
    let mut top_k = overrides.top_k.or(settings.top_k);
    if top_k.is_some() && !meta.supports_top_k {
        warnings.push(format!("driver {driver} does not support top_k; dropped"));
        top_k = None;
    }

    let entry = catalog::lookup(driver, &model);
    let catalog_context = entry.map(|e| e.context_window);
    let catalog_max_output = entry.map(|e| e.max_output_tokens);

    let mut max_tokens = overrides
        .max_tokens
        .or(settings.max_tokens)
        .or(catalog_max_output)
        .unwrap_or(DEFAULT_MAX_TOKENS);
    if let Some(ceiling) = catalog_max_output {
        if max_tokens > ceiling {
            warnings.push(format!(
                "max_tokens {max_tokens} exceeds the {model} ceiling of {ceiling}; clamped"
            ));
            max_tokens = ceiling;
        }
    }

    let mut context_length = overrides
        .context_length
        .or(settings.context_length)
        .map(|v| v as usize)
        .or(catalog_context)
        .unwrap_or(meta.default_context_window);
    if let Some(ceiling) = catalog_context {
        if context_length > ceiling {
            warnings.push(format!(
                "context_length {context_length} exceeds the {model} window of {ceiling}; clamped"
            ));
            context_length = ceiling;
        }
    }

    let timeout_secs = overrides
        .timeout_secs
        .or(settings.timeout_secs)
        .unwrap_or(DEFAULT_TIMEOUT_SECS);

    // Agent extras layer over global extras key-by-key.
    let mut extra = settings
        .extra
        .as_object()
        .cloned()
        .unwrap_or_default();
    for (k, v) in &overrides.extra {
        extra.insert(k.clone(), v.clone());
    }

    for w in &warnings {
        warn!(driver, "{w}");
    }

    Ok((
        NormalizedModelConfig {
            model,
            temperature,
            max_tokens,
            top_p,
            top_k,
            context_length,
            timeout_secs,
            extra,
        },
        warnings,
    ))
}

pub(crate) fn unknown_driver_error(driver: &str) -> BackendError {
    let known: Vec<&str> = registry::known_driver_ids().collect();
    BackendError::UnknownDriver(format!(
        "{driver:?}; known drivers: {}",
        known.join(", ")
    ))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
