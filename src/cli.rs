// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "owliabot",
    version,
    about = "Multi-channel LLM agent gateway",
    long_about = "Receives messages from chat channels (Telegram, Discord, HTTP), drives an \
                  agentic loop over configured LLM providers, and executes tools under tiered \
                  security gates."
)]
pub struct Cli {
    /// Explicit config file (merged over the discovered layers)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway (default when no subcommand is given)
    Start,
    /// Credential management
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
    /// Generate a starter configuration
    Onboard {
        /// Write to ~/.config/owliabot/config.yaml instead of stdout
        #[arg(long)]
        write: bool,
    },
    /// Print the merged effective configuration as YAML
    ShowConfig,
    /// Print a provider/channel summary without starting the gateway
    Status,
}

#[derive(Subcommand)]
pub enum AuthCommands {
    /// Store OAuth credentials for a provider (e.g. `auth setup anthropic`)
    Setup { provider: String },
    /// Remove stored credentials for a provider
    Remove { provider: String },
}
