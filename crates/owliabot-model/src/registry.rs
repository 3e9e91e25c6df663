// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Driver registry: static metadata for the supported provider families.
//!
//! This module is the single source of truth for how a `provider.id` maps to
//! a driver implementation and to its canonical API-key environment variable.

use owliabot_config::Config;

/// The closed set of driver families.  Adding a provider family is a code
/// change, not runtime plugin loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// First-party native API (Anthropic messages API).
    Native,
    /// Any endpoint speaking the `/chat/completions` wire format.
    OpenAiCompat,
    /// Sub-process CLI backend configured under `[cli]`.
    Cli,
}

/// Metadata describing a registered native or compatible driver.
#[derive(Debug, Clone)]
pub struct DriverMeta {
    pub id: &'static str,
    pub name: &'static str,
    pub kind: DriverKind,
    pub default_base_url: Option<&'static str>,
    /// Whether this id supports disk-backed OAuth credentials.
    pub oauth_capable: bool,
}

static DRIVERS: &[DriverMeta] = &[
    DriverMeta {
        id: "anthropic",
        name: "Anthropic",
        kind: DriverKind::Native,
        default_base_url: Some("https://api.anthropic.com"),
        oauth_capable: true,
    },
    DriverMeta {
        id: "openai",
        name: "OpenAI",
        kind: DriverKind::OpenAiCompat,
        default_base_url: Some("https://api.openai.com/v1"),
        oauth_capable: false,
    },
    DriverMeta {
        id: "openai-codex",
        name: "OpenAI Codex",
        kind: DriverKind::OpenAiCompat,
        default_base_url: Some("https://api.openai.com/v1"),
        oauth_capable: true,
    },
    DriverMeta {
        id: "openrouter",
        name: "OpenRouter",
        kind: DriverKind::OpenAiCompat,
        default_base_url: Some("https://openrouter.ai/api/v1"),
        oauth_capable: false,
    },
    DriverMeta {
        id: "claude-cli",
        name: "Claude CLI",
        kind: DriverKind::Cli,
        default_base_url: None,
        oauth_capable: false,
    },
    DriverMeta {
        id: "codex-cli",
        name: "Codex CLI",
        kind: DriverKind::Cli,
        default_base_url: None,
        oauth_capable: false,
    },
];

pub fn get_driver(id: &str) -> Option<&'static DriverMeta> {
    DRIVERS.iter().find(|d| d.id == id)
}

/// Resolve the driver family for a provider id.
///
/// Ids registered under `[cli]` in config are CLI backends even when not in
/// the static table; unknown ids with a `base_url` are treated as
/// OpenAI-compatible endpoints (the lingua franca of self-hosted servers).
pub fn driver_kind(id: &str, config: &Config) -> DriverKind {
    if config.cli.contains_key(id) {
        return DriverKind::Cli;
    }
    match get_driver(id) {
        Some(meta) => meta.kind,
        None => DriverKind::OpenAiCompat,
    }
}

/// Canonical API-key environment variable for a provider id: uppercase with
/// hyphens replaced by underscores, suffixed `_API_KEY`
/// (e.g. `openai-codex` → `OPENAI_CODEX_API_KEY`).
pub fn api_key_env_for(id: &str) -> String {
    let mut name: String = id
        .chars()
        .map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() })
        .collect();
    name.push_str("_API_KEY");
    name
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
