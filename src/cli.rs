// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "colloquyd", version, about = "Agentic conversation engine")]
pub struct Cli {
    /// Path to an explicit config file (merged over the discovered layers).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Override the HTTP bind address from config.
    #[arg(long)]
    pub bind: Option<String>,

    /// Log filter, e.g. "colloquy=debug" (overrides RUST_LOG).
    #[arg(long)]
    pub log: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the engine server (the default when no subcommand is given).
    Serve,
    /// Print the effective merged configuration and exit.
    ShowConfig,
    /// List registered backend drivers and exit.
    ListDrivers,
}
