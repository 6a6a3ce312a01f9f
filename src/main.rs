// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use colloquy_core::{
    default_driver_factory, spawn_workers, AgentProfile, Broadcaster, ContextFilter,
    ConversationService, ConversationStore, EventQueue, InMemoryEventQueue, MemoryStore,
    ToolDispatcher, TurnProcessor, TurnQueue,
};
use colloquy_http::AppState;
use colloquy_tools::ToolRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref());

    if let Some(cmd) = &cli.command {
        match cmd {
            Commands::ShowConfig => {
                let config = colloquy_config::load(cli.config.as_deref())?;
                println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
                return Ok(());
            }
            Commands::ListDrivers => {
                for meta in colloquy_model::list_drivers() {
                    println!("{:<14} {}", meta.id, meta.description);
                }
                return Ok(());
            }
            Commands::Serve => {}
        }
    }

    let mut config = colloquy_config::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind;
    }
    serve(config).await
}

async fn serve(config: colloquy_config::Config) -> anyhow::Result<()> {
    // All components are built once here and passed as explicit constructor
    // dependencies; nothing resolves collaborators at call sites.
    let store = Arc::new(MemoryStore::new());
    load_agents(&store, &config)?;

    let registry = Arc::new(ToolRegistry::with_builtins(&config.tools));
    let dispatcher = Arc::new(ToolDispatcher::new(
        registry,
        config.engine.tool_output_token_cap,
    ));

    let events = Arc::new(InMemoryEventQueue::new(Duration::from_secs(
        config.engine.event_ttl_secs,
    )));
    let broadcaster = Arc::new(Broadcaster::new(events.clone() as Arc<dyn EventQueue>));
    let queue = Arc::new(TurnQueue::new());

    let filter = ContextFilter::new(
        config.engine.token_safety_margin,
        config.engine.summarization_prompt.clone(),
    );
    let backends: HashMap<_, _> = config.backends.clone();
    let processor = Arc::new(TurnProcessor::new(
        store.clone() as Arc<dyn ConversationStore>,
        broadcaster.clone(),
        dispatcher.clone(),
        queue.clone(),
        filter,
        backends,
        default_driver_factory(),
    ));
    let workers = spawn_workers(
        processor,
        queue.clone(),
        config.engine.workers,
        Duration::from_secs(config.engine.turn_timeout_secs),
    );
    tracing::info!(workers = workers.len(), "turn workers running");

    let service = Arc::new(ConversationService::new(
        store as Arc<dyn ConversationStore>,
        queue,
        broadcaster,
        dispatcher,
    ));
    let state = AppState {
        service,
        events: events as Arc<dyn EventQueue>,
        pop_timeout: Duration::from_millis(config.engine.event_pop_timeout_ms),
    };
    let app = colloquy_http::router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.server.bind_addr))?;
    tracing::info!(addr = %config.server.bind_addr, "engine listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Load agent-profile YAML files from the configured directory.  The engine
/// consumes agents; creating and editing them is the platform's job.
fn load_agents(store: &MemoryStore, config: &colloquy_config::Config) -> anyhow::Result<()> {
    let Some(dir) = &config.server.agents_dir else {
        tracing::warn!("no agents_dir configured; the store starts empty");
        return Ok(());
    };
    let mut count = 0usize;
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if !is_yaml {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let profile: AgentProfile = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        tracing::info!(agent_id = %profile.id, path = %path.display(), "agent loaded");
        store.insert_profile(profile);
        count += 1;
    }
    tracing::info!(count, "agent profiles loaded");
    Ok(())
}

fn init_logging(filter_override: Option<&str>) {
    let filter = match filter_override {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("colloquy=info,tower_http=info")),
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}
