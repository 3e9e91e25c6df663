// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider runner: failover, context-window guarding, CLI fallback.
//!
//! Providers are tried in ascending `priority` order.  Within one provider,
//! only a context-overflow error is retried (with a shrinking window: ×1.0,
//! ×0.8, ×0.6); every other error advances failover.  Cancellation is never
//! retried anywhere — it propagates straight to the caller.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use owliabot_config::{Config, GuardConfig, ProviderConfig};

use crate::{
    guard::{guard_context, GuardLimits},
    registry::{api_key_env_for, driver_kind, DriverKind},
    AnthropicProvider, ChatContext, CliRunArgs, CliRunner, CompleteOptions, LlmResponse, Message,
    ModelProvider, OAuthStore, OpenAiCompatProvider, ProviderError, ToolSchema,
};

/// Window shrink factors applied on successive context-overflow retries.
const OVERFLOW_WINDOW_FACTORS: &[f64] = &[1.0, 0.8, 0.6];

/// Context window assumed when neither config nor the registry knows better.
const DEFAULT_CONTEXT_WINDOW: usize = 128_000;

/// Per-run options threaded from the agentic loop.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub tools: Vec<ToolSchema>,
    /// Internal session key, used to resume CLI sessions.
    pub session_key: Option<String>,
    pub is_first_message: bool,
    /// Provider id to try first, ahead of the configured priority order
    /// (per-session model override).
    pub preferred_provider: Option<String>,
    pub cancel: Option<tokio::sync::watch::Receiver<bool>>,
}

/// Drives the ordered provider list for one completion.
pub struct ProviderRunner {
    providers: Vec<ProviderConfig>,
    drivers: HashMap<String, Arc<dyn ModelProvider>>,
    cli: Arc<CliRunner>,
    oauth: Arc<OAuthStore>,
    guard_cfg: GuardConfig,
    config: Arc<Config>,
}

impl ProviderRunner {
    /// Construct drivers for every configured provider.
    pub fn from_config(config: Arc<Config>) -> Self {
        let mut providers = config.providers.clone();
        providers.sort_by_key(|p| p.priority);

        let mut drivers: HashMap<String, Arc<dyn ModelProvider>> = HashMap::new();
        for p in &providers {
            match driver_kind(&p.id, &config) {
                DriverKind::Native => {
                    drivers.insert(
                        p.id.clone(),
                        Arc::new(AnthropicProvider::new(&p.id, p.base_url.clone())),
                    );
                }
                DriverKind::OpenAiCompat => {
                    let base = p
                        .base_url
                        .clone()
                        .or_else(|| {
                            crate::registry::get_driver(&p.id)
                                .and_then(|d| d.default_base_url.map(str::to_string))
                        })
                        .unwrap_or_else(|| "https://api.openai.com/v1".into());
                    drivers.insert(
                        p.id.clone(),
                        Arc::new(OpenAiCompatProvider::new(&p.id, &base)),
                    );
                }
                DriverKind::Cli => {} // handled by the CLI runner
            }
        }

        let oauth = Arc::new(OAuthStore::new(&config.agent.state_dir()));
        let cli = Arc::new(CliRunner::new(config.cli.clone()));
        Self {
            providers,
            drivers,
            cli,
            oauth,
            guard_cfg: config.guard.clone(),
            config,
        }
    }

    /// Test/embedding constructor with explicit drivers.
    pub fn with_drivers(
        config: Arc<Config>,
        drivers: HashMap<String, Arc<dyn ModelProvider>>,
    ) -> Self {
        let mut providers = config.providers.clone();
        providers.sort_by_key(|p| p.priority);
        let oauth = Arc::new(OAuthStore::new(&config.agent.state_dir()));
        let cli = Arc::new(CliRunner::new(config.cli.clone()));
        Self {
            providers,
            drivers,
            cli,
            oauth,
            guard_cfg: config.guard.clone(),
            config,
        }
    }

    pub fn cli_runner(&self) -> &Arc<CliRunner> {
        &self.cli
    }

    /// Provider ids in failover order (for `/status` rendering).
    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.id.clone()).collect()
    }

    /// Run one completion across the failover list.
    pub async fn run(
        &self,
        messages: &[Message],
        opts: &RunOptions,
    ) -> Result<LlmResponse, ProviderError> {
        if self.providers.is_empty() {
            return Err(ProviderError::Api("no providers configured".into()));
        }

        // A session-level override moves its provider to the front; the rest
        // of the failover order is unchanged.
        let mut ordered: Vec<&ProviderConfig> = self.providers.iter().collect();
        if let Some(pref) = &opts.preferred_provider {
            if let Some(pos) = ordered.iter().position(|p| &p.id == pref) {
                let preferred = ordered.remove(pos);
                ordered.insert(0, preferred);
            }
        }

        let mut last_err: Option<ProviderError> = None;
        for provider in ordered {
            let attempt = match driver_kind(&provider.id, &self.config) {
                DriverKind::Cli => self.run_cli(provider, messages, opts).await,
                _ => self.run_api(provider, messages, opts).await,
            };
            match attempt {
                Ok(resp) => return Ok(resp),
                Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
                Err(e) => {
                    warn!(provider = %provider.id, error = %e, "provider failed; trying next");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ProviderError::Api("all providers failed".into())))
    }

    // ── API providers (native + OpenAI-compatible) ────────────────────────────

    async fn run_api(
        &self,
        provider: &ProviderConfig,
        messages: &[Message],
        opts: &RunOptions,
    ) -> Result<LlmResponse, ProviderError> {
        let driver = self
            .drivers
            .get(&provider.id)
            .ok_or_else(|| ProviderError::Api(format!("no driver for provider {}", provider.id)))?;

        let api_key = self.resolve_api_key(provider).await?;
        let complete_opts = CompleteOptions {
            api_key,
            max_tokens: provider.max_tokens,
            temperature: provider.temperature,
            reasoning: provider.reasoning.clone(),
            cancel: opts.cancel.clone(),
        };

        let base_window = provider
            .context_window
            .map(|w| w as usize)
            .unwrap_or(DEFAULT_CONTEXT_WINDOW);
        let max_tokens = provider.max_tokens.unwrap_or(4096) as usize;

        let mut last_err: Option<ProviderError> = None;
        for factor in OVERFLOW_WINDOW_FACTORS {
            let window = (base_window as f64 * factor) as usize;
            let guarded = guard_context(
                messages.to_vec(),
                &self.guard_cfg,
                GuardLimits {
                    context_window: window,
                    max_tokens,
                    reserve_tokens: self.guard_cfg.reserve_tokens,
                },
            );
            debug!(
                provider = %provider.id,
                window,
                dropped = guarded.dropped,
                "calling provider"
            );
            let ctx = ChatContext::from_messages(guarded.messages, opts.tools.clone());
            match driver.complete(&provider.model, &ctx, &complete_opts).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_context_overflow() => {
                    warn!(provider = %provider.id, window, "context overflow; retrying with smaller window");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.expect("overflow loop ran at least once"))
    }

    /// Key resolution ladder: configured literal ≻ env var ≻ OAuth file.
    async fn resolve_api_key(
        &self,
        provider: &ProviderConfig,
    ) -> Result<Option<String>, ProviderError> {
        if let Some(key) = &provider.api_key {
            return Ok(Some(key.clone()));
        }
        let env_name = provider
            .api_key_env
            .clone()
            .unwrap_or_else(|| api_key_env_for(&provider.id));
        if let Ok(key) = std::env::var(&env_name) {
            if !key.is_empty() {
                return Ok(Some(key));
            }
        }
        self.oauth.access_token(&provider.id).await
    }

    // ── CLI providers ─────────────────────────────────────────────────────────

    async fn run_cli(
        &self,
        provider: &ProviderConfig,
        messages: &[Message],
        opts: &RunOptions,
    ) -> Result<LlmResponse, ProviderError> {
        // The CLI carries its own conversation state, so only the newest user
        // utterance goes on the command line.
        let prompt = messages
            .iter()
            .rev()
            .find(|m| m.is_real_user_message())
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let system_prompt = messages
            .iter()
            .filter(|m| m.role == crate::Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let outcome = self
            .cli
            .run(
                CliRunArgs {
                    backend_id: &provider.id,
                    model: &provider.model,
                    prompt: &prompt,
                    system_prompt: &system_prompt,
                    is_first_message: opts.is_first_message,
                    session_key: opts.session_key.as_deref(),
                },
                opts.cancel.clone(),
            )
            .await?;

        Ok(LlmResponse::text(&provider.id, &provider.model, outcome.text))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
