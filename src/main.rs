// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{AuthCommands, Cli, Commands};
use owliabot_channels::{Channel, InboundMessage, ReplyRouter};
use owliabot_config::Config;
use owliabot_core::{SessionStore, TranscriptStore};
use owliabot_gateway::http::AppState;
use owliabot_gateway::{
    resolve_gateway_token, ChannelWriteGate, DeviceStore, Gateway, GatewayDeps, InfraStore,
};
use owliabot_model::{OAuthCredentials, OAuthStore, ProviderRunner};
use owliabot_tools::{
    AuditLogger, CooldownTracker, ExecDeps, HelpTool, PolicyEngine, ToolCallLimiter, ToolRegistry,
    WriteGate,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Pin the process-wide TLS crypto provider before any reqwest client is
    // built.  Fails only when a provider is already installed.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    match &cli.command {
        None | Some(Commands::Start) => run_gateway(&cli).await,
        Some(Commands::Auth { command }) => match command {
            AuthCommands::Setup { provider } => auth_setup(&cli, provider).await,
            AuthCommands::Remove { provider } => auth_remove(&cli, provider),
        },
        Some(Commands::Onboard { write }) => onboard(*write),
        Some(Commands::ShowConfig) => {
            let config = owliabot_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Some(Commands::Status) => status(&cli),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

// ── Gateway runtime ───────────────────────────────────────────────────────────

async fn run_gateway(cli: &Cli) -> anyhow::Result<()> {
    let config = Arc::new(owliabot_config::load(cli.config.as_deref())?);
    if config.providers.is_empty() {
        anyhow::bail!("no providers configured; run `owliabot onboard` to generate a config");
    }
    let state_dir = config.agent.state_dir();
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("creating state dir {}", state_dir.display()))?;

    // Stores.
    let sessions = Arc::new(SessionStore::open(&state_dir)?);
    let transcripts = Arc::new(TranscriptStore::open(&state_dir)?);
    let infra = Arc::new(InfraStore::new());
    let devices = Arc::new(DeviceStore::open(&state_dir)?);

    // Model runner and tool stack.
    let runner = Arc::new(ProviderRunner::from_config(config.clone()));
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(HelpTool::new(&registry)))?;

    // Channels and the shared reply router.
    let router = ReplyRouter::new();
    let (inbound_tx, mut inbound_rx) = tokio::sync::mpsc::channel::<InboundMessage>(256);
    let mut channels: HashMap<String, Arc<dyn Channel>> = HashMap::new();

    #[cfg(feature = "telegram")]
    if config.channels.telegram.enabled {
        let env_name = config
            .channels
            .telegram
            .token_env
            .clone()
            .unwrap_or_else(|| "TELEGRAM_BOT_TOKEN".into());
        let token = std::env::var(&env_name)
            .with_context(|| format!("telegram enabled but {env_name} is not set"))?;
        let channel = Arc::new(owliabot_channels::telegram::TelegramChannel::new(&token));
        let bot = channel.bot();
        channels.insert("telegram".into(), channel);
        let tx = inbound_tx.clone();
        tokio::spawn(async move {
            owliabot_channels::telegram::run_listener(bot, tx).await;
        });
        tracing::info!("telegram channel started");
    }

    #[cfg(feature = "discord")]
    if config.channels.discord.enabled {
        let env_name = config
            .channels
            .discord
            .token_env
            .clone()
            .unwrap_or_else(|| "DISCORD_BOT_TOKEN".into());
        let token = std::env::var(&env_name)
            .with_context(|| format!("discord enabled but {env_name} is not set"))?;
        channels.insert(
            "discord".into(),
            Arc::new(owliabot_channels::discord::DiscordChannel::new(&token)),
        );
        let tx = inbound_tx.clone();
        tokio::spawn(async move {
            owliabot_channels::discord::run_listener(&token, tx).await;
        });
        tracing::info!("discord channel started");
    }

    // Hold the sender so the fan-in channel stays open even when no chat
    // adapter is compiled in (HTTP-only deployments).
    let _inbound_tx = inbound_tx;

    // Executor dependencies shared by the pipeline and the HTTP server.
    let write_gate: Arc<dyn WriteGate> = Arc::new(ChannelWriteGate::new(
        channels.clone(),
        router.clone(),
        &config.tools,
    ));
    let exec = ExecDeps {
        registry: registry.clone(),
        policy: Arc::new(PolicyEngine::from_config(&config.tools)),
        audit: Arc::new(AuditLogger::file_backed(state_dir.join("audit.jsonl"))),
        cooldowns: Arc::new(CooldownTracker::from_config(&config.tools)),
        rate_limiter: Arc::new(ToolCallLimiter::from_config(&config.tools)),
        write_gate: Some(write_gate),
        tool_timeout: Duration::from_millis(config.tools.timeout_ms),
        confirmation_enabled: config.tools.confirmation_enabled,
    };

    let gateway = Arc::new(Gateway::new(GatewayDeps {
        config: config.clone(),
        channels,
        router,
        sessions,
        transcripts,
        infra: infra.clone(),
        runner,
        exec: exec.clone(),
        prompt_builder: Arc::new(owliabot_gateway::DefaultPromptBuilder {
            agent_id: config.agent.id.clone(),
            workspace: config.agent.workspace.clone(),
        }),
    }));

    // Shutdown signal shared by the HTTP server and the fan-in loop.
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    // HTTP channel server.
    if config.gateway.enabled {
        let token = resolve_gateway_token(config.gateway.gateway_token.as_deref(), &state_dir)?;
        if let Some(raw) = &token.fresh_raw {
            // Shown exactly once; only the hash is stored.
            println!("Gateway admin token (save it now, it will not be shown again):\n  {raw}");
        }
        let state = Arc::new(AppState {
            config: config.clone(),
            devices,
            infra,
            exec,
            gateway_token_hash: token.hash,
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION"),
        });
        let mut http_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = http_shutdown.wait_for(|s| *s).await;
            };
            if let Err(e) = owliabot_gateway::http::serve(state, shutdown).await {
                tracing::error!(error = %e, "HTTP channel server failed");
            }
        });
    }

    tracing::info!(agent = %config.agent.id, "owliabot gateway running");

    // Fan-in: every inbound message runs as its own task.
    loop {
        tokio::select! {
            _ = shutdown_rx.wait_for(|s| *s) => break,
            msg = inbound_rx.recv() => {
                let Some(msg) = msg else { break };
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    if let Err(e) = gateway.handle_inbound(msg).await {
                        tracing::error!(error = %e, "inbound message processing failed");
                    }
                });
            }
        }
    }
    tracing::info!("owliabot stopped");
    Ok(())
}

// ── Auth setup ────────────────────────────────────────────────────────────────

async fn auth_setup(cli: &Cli, provider: &str) -> anyhow::Result<()> {
    let config = owliabot_config::load(cli.config.as_deref())?;
    let store = OAuthStore::new(&config.agent.state_dir());

    println!("Storing OAuth credentials for '{provider}'.");
    let access_token = prompt("Access token: ")?;
    if access_token.is_empty() {
        anyhow::bail!("access token must not be empty");
    }
    let refresh_token = prompt("Refresh token (blank to skip): ")?;
    let token_url = prompt("Token refresh URL (blank to skip): ")?;
    let client_id = prompt("OAuth client id (blank to skip): ")?;

    let creds = OAuthCredentials {
        access_token,
        refresh_token: non_empty(refresh_token),
        token_url: non_empty(token_url),
        client_id: non_empty(client_id),
        expires_at: None,
    };
    store.save(provider, &creds)?;
    println!("Credentials saved under {}/auth/{provider}.yaml", config.agent.state_dir().display());
    Ok(())
}

fn auth_remove(cli: &Cli, provider: &str) -> anyhow::Result<()> {
    let config = owliabot_config::load(cli.config.as_deref())?;
    OAuthStore::new(&config.agent.state_dir()).remove(provider)?;
    println!("Removed credentials for '{provider}'.");
    Ok(())
}

fn prompt(label: &str) -> anyhow::Result<String> {
    print!("{label}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

// ── Onboard ───────────────────────────────────────────────────────────────────

const STARTER_CONFIG: &str = r#"# owliabot starter configuration
agent:
  id: main

providers:
  - id: anthropic
    model: claude-sonnet-4-5
    priority: 1
    context_window: 200000
  - id: claude-cli
    model: sonnet
    priority: 2

cli:
  claude-cli:
    command: claude
    base_args: ["-p", "--output-format", "json"]
    resume_args: ["--resume", "{sessionId}"]
    model_flag: "--model"
    system_prompt_flag: "--append-system-prompt"
    system_prompt_when: first
    output: json
    session_id_fields: ["session_id"]
    clear_env: ["ANTHROPIC_API_KEY"]
    serialize: true

channels:
  telegram:
    enabled: false
    token_env: TELEGRAM_BOT_TOKEN
  group:
    activation: mention
    mention_patterns: ["(?i)@owliabot"]

gateway:
  enabled: false
  host: 127.0.0.1
  port: 18900
"#;

fn onboard(write: bool) -> anyhow::Result<()> {
    if !write {
        print!("{STARTER_CONFIG}");
        return Ok(());
    }
    let dir = dirs::home_dir()
        .context("cannot resolve home directory")?
        .join(".config/owliabot");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("config.yaml");
    if path.exists() {
        anyhow::bail!("{} already exists; not overwriting", path.display());
    }
    std::fs::write(&path, STARTER_CONFIG)?;
    println!("Wrote {}", path.display());
    Ok(())
}

// ── Status ────────────────────────────────────────────────────────────────────

fn status(cli: &Cli) -> anyhow::Result<()> {
    let config: Config = owliabot_config::load(cli.config.as_deref())?;
    println!("owliabot {}", env!("CARGO_PKG_VERSION"));
    println!("state dir: {}", config.agent.state_dir().display());
    println!("\nproviders (failover order):");
    let mut providers = config.providers.clone();
    providers.sort_by_key(|p| p.priority);
    for p in &providers {
        println!("  {} (priority {}, model {})", p.id, p.priority, p.model);
    }
    if providers.is_empty() {
        println!("  (none configured)");
    }
    println!("\nchannels:");
    println!("  telegram: {}", if config.channels.telegram.enabled { "enabled" } else { "disabled" });
    println!("  discord:  {}", if config.channels.discord.enabled { "enabled" } else { "disabled" });
    println!(
        "  http:     {}",
        if config.gateway.enabled {
            format!("{}:{}", config.gateway.host, config.gateway.port)
        } else {
            "disabled".into()
        }
    );
    Ok(())
}
