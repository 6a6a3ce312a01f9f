// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod anthropic;
pub mod catalog;
pub mod ollama;
pub mod openai_compat;
pub mod registry;
pub mod tokens;
mod config;
mod driver;
mod error;
mod fake;
mod types;

pub use config::{normalize, ModelOverrides, NormalizedModelConfig};
pub use driver::{BackendDriver, Capabilities, ChunkSink, NullSink, ResponseStream};
pub use error::BackendError;
pub use fake::FakeDriver;
pub use registry::{get_driver, known_driver_ids, list_drivers, DriverMeta};
pub use types::*;

use colloquy_config::BackendSettings;

use anthropic::AnthropicDriver;
use ollama::OllamaDriver;
use openai_compat::{AuthStyle, OpenAiCompatDriver};

/// Construct a boxed [`BackendDriver`] bound to a resolved configuration.
///
/// Pure: no network I/O happens here; connections are opened lazily on the
/// first request.  The driver id selects the implementation; base URL and
/// API key come from `settings` with registry defaults as fallback.
pub fn with_config(
    driver: &str,
    cfg: NormalizedModelConfig,
    settings: &BackendSettings,
) -> Result<Box<dyn BackendDriver>, BackendError> {
    let meta = registry::get_driver(driver).ok_or_else(|| config::unknown_driver_error(driver))?;
    let base_url = settings
        .base_url
        .clone()
        .or_else(|| meta.default_base_url.map(String::from))
        .unwrap_or_default();
    let key = resolve_api_key(meta, settings);

    match driver {
        "ollama" => Ok(Box::new(OllamaDriver::with_config(cfg, base_url))),
        "anthropic" => Ok(Box::new(AnthropicDriver::with_config(cfg, base_url, key))),
        "openai" => Ok(Box::new(OpenAiCompatDriver::with_config(
            "openai",
            cfg,
            &base_url,
            key,
            AuthStyle::Bearer,
        ))),
        "vllm" => {
            // vLLM accepts an optional bearer token.
            let auth = if key.is_some() { AuthStyle::Bearer } else { AuthStyle::None };
            Ok(Box::new(OpenAiCompatDriver::with_config(
                "vllm", cfg, &base_url, key, auth,
            )))
        }
        "huggingface" => Ok(Box::new(OpenAiCompatDriver::with_config(
            "huggingface",
            cfg,
            &base_url,
            key,
            AuthStyle::Bearer,
        ))),
        "fake" => Ok(Box::new(
            FakeDriver::default().with_context_length(cfg.context_length),
        )),
        other => Err(config::unknown_driver_error(other)),
    }
}

/// Explicit key > configured env var > registry default env var.
fn resolve_api_key(meta: &DriverMeta, settings: &BackendSettings) -> Option<String> {
    if let Some(k) = &settings.api_key {
        return Some(k.clone());
    }
    if let Some(env) = &settings.api_key_env {
        return std::env::var(env).ok();
    }
    if let Some(env) = meta.default_api_key_env {
        return std::env::var(env).ok();
    }
    None
}
