// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    /// Ordered provider failover list.  Lower `priority` = preferred.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Sub-process CLI backends keyed by provider id (e.g. `claude-cli`).
    #[serde(default)]
    pub cli: HashMap<String, CliBackendConfig>,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

// ─── Agent ────────────────────────────────────────────────────────────────────

fn default_agent_id() -> String {
    "main".into()
}
fn default_max_iterations() -> u32 {
    25
}
fn default_loop_timeout_ms() -> u64 {
    120_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent identifier used in session keys (`agent:<id>:...`).
    #[serde(default = "default_agent_id")]
    pub id: String,
    /// Workspace path handed to tools via the tool context.
    pub workspace: Option<PathBuf>,
    /// State directory root.  Defaults to `~/.owliabot`.
    pub state_dir: Option<PathBuf>,
    /// Maximum model ↔ tool iterations per inbound message.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Wall-clock budget for one agentic loop run.
    #[serde(default = "default_loop_timeout_ms")]
    pub loop_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            workspace: None,
            state_dir: None,
            max_iterations: default_max_iterations(),
            loop_timeout_ms: default_loop_timeout_ms(),
        }
    }
}

impl AgentConfig {
    /// Resolved state directory (`state_dir` or `~/.owliabot`).
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".owliabot")
        })
    }
}

// ─── Providers ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider id.  Native drivers ("anthropic"), OpenAI-compatible
    /// endpoints ("openai", "openrouter", custom ids with `base_url`), or
    /// CLI backends ("claude-cli", "codex-cli", any key under `cli`).
    pub id: String,
    /// Model name forwarded to the provider.
    pub model: String,
    /// Explicit API key; prefer `api_key_env` so secrets stay out of config.
    pub api_key: Option<String>,
    /// Environment variable that holds the API key.  When unset, the
    /// canonical `<ID>_API_KEY` name is derived from the provider id.
    pub api_key_env: Option<String>,
    /// Failover order; lower wins.
    #[serde(default)]
    pub priority: u32,
    pub base_url: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Context window used by the guard.  `None` falls back to the driver
    /// registry default.
    pub context_window: Option<u32>,
    /// Reasoning effort forwarded to providers that support it.
    pub reasoning: Option<String>,
}

// ─── CLI backends ─────────────────────────────────────────────────────────────

fn default_max_prompt_arg_chars() -> usize {
    32_768
}
fn default_cli_timeout_ms() -> u64 {
    600_000
}

/// When the system prompt flag is injected into the CLI argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SystemPromptWhen {
    #[default]
    Always,
    /// Only on the first message of a session.
    First,
}

/// How the CLI keeps conversational state between invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CliSessionMode {
    /// Pass the prior session id through `resume_args`.
    #[default]
    Resume,
    /// Stateless: every invocation starts fresh.
    None,
}

/// Output format produced by the CLI on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CliOutputFormat {
    #[default]
    Text,
    Json,
    Jsonl,
}

/// How the prompt is delivered to the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CliInputMode {
    /// Trailing positional argument (stdin fallback for oversized prompts).
    #[default]
    Arg,
    Stdin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliBackendConfig {
    /// Executable name or path (e.g. `claude`, `codex`).
    pub command: String,
    #[serde(default)]
    pub base_args: Vec<String>,
    /// Arguments appended when resuming a prior session.  `{sessionId}`
    /// placeholders are substituted with the stored CLI session id.
    #[serde(default)]
    pub resume_args: Vec<String>,
    /// Flag that selects the model, e.g. `--model`.  Omitted when `None`.
    pub model_flag: Option<String>,
    /// Maps requested model names to the names this tool accepts.  Unknown
    /// names pass through unchanged.
    #[serde(default)]
    pub model_aliases: HashMap<String, String>,
    /// Flag that carries the system prompt, e.g. `--append-system-prompt`.
    pub system_prompt_flag: Option<String>,
    #[serde(default)]
    pub system_prompt_when: SystemPromptWhen,
    #[serde(default)]
    pub session_mode: CliSessionMode,
    /// JSON paths probed (in order) for the session id in parsed output.
    #[serde(default)]
    pub session_id_fields: Vec<String>,
    #[serde(default)]
    pub output: CliOutputFormat,
    #[serde(default)]
    pub input: CliInputMode,
    /// Prompts longer than this are streamed via stdin instead of argv.
    #[serde(default = "default_max_prompt_arg_chars")]
    pub max_prompt_arg_chars: usize,
    /// Environment variables removed from the child process (e.g. unset
    /// ANTHROPIC_API_KEY so `claude` uses its own auth).
    #[serde(default)]
    pub clear_env: Vec<String>,
    /// Run invocations of this backend one at a time.
    #[serde(default)]
    pub serialize: bool,
    #[serde(default = "default_cli_timeout_ms")]
    pub timeout_ms: u64,
}

// ─── Channels ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub group: GroupConfig,
}

/// Group activation fallback applied when no channel-specific rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GroupActivation {
    #[default]
    Mention,
    Always,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub activation: GroupActivation,
    /// Regex patterns that count as a mention of the bot.
    #[serde(default)]
    pub mention_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    pub token_env: Option<String>,
    /// Sender ids allowed in DMs.  Empty = everyone.
    #[serde(default)]
    pub allow_list: Vec<String>,
    /// Sender ids allowed in groups.  Empty = everyone.
    #[serde(default)]
    pub member_allow_list: Vec<String>,
    /// Per-group activation overrides keyed by group id.
    #[serde(default)]
    pub groups: HashMap<String, GroupOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupOverride {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub require_mention: bool,
    /// Numeric sender ids or `@username` entries allowed to trigger the bot.
    /// Empty = everyone in the group.
    #[serde(default)]
    pub allow_from: Vec<String>,
}

impl Default for GroupOverride {
    fn default() -> Self {
        Self {
            enabled: true,
            require_mention: true,
            allow_from: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    pub token_env: Option<String>,
    #[serde(default)]
    pub allow_list: Vec<String>,
    #[serde(default)]
    pub member_allow_list: Vec<String>,
    /// Channels where the bot responds without a mention.
    #[serde(default)]
    pub channel_allow_list: Vec<String>,
}

// ─── Gateway (HTTP channel server) ────────────────────────────────────────────

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    18_900
}
fn default_body_limit() -> usize {
    1024 * 1024
}
fn default_idempotency_ttl_ms() -> u64 {
    10 * 60 * 1000
}
fn default_poll_batch_size() -> usize {
    100
}
fn default_event_ttl_ms() -> u64 {
    24 * 60 * 60 * 1000
}
fn default_device_event_cap() -> usize {
    1000
}
fn default_device_window_ms() -> u64 {
    60_000
}
fn default_device_max() -> u32 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Static admin token.  When unset, one is generated on first start and
    /// its hash stored under the state dir.
    pub gateway_token: Option<String>,
    /// CIDR blocks allowed to reach non-public routes.  Empty = any.
    #[serde(default)]
    pub ip_allowlist: Vec<String>,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
    #[serde(default = "default_idempotency_ttl_ms")]
    pub idempotency_ttl_ms: u64,
    #[serde(default = "default_poll_batch_size")]
    pub poll_batch_size: usize,
    #[serde(default = "default_event_ttl_ms")]
    pub event_ttl_ms: u64,
    /// Maximum unacknowledged events retained per device; older events are
    /// dropped and counted in `X-Events-Dropped`.
    #[serde(default = "default_device_event_cap")]
    pub per_device_event_cap: usize,
    #[serde(default = "default_device_window_ms")]
    pub device_window_ms: u64,
    #[serde(default = "default_device_max")]
    pub device_max_requests: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_port(),
            gateway_token: None,
            ip_allowlist: Vec::new(),
            body_limit_bytes: default_body_limit(),
            idempotency_ttl_ms: default_idempotency_ttl_ms(),
            poll_batch_size: default_poll_batch_size(),
            event_ttl_ms: default_event_ttl_ms(),
            per_device_event_cap: default_device_event_cap(),
            device_window_ms: default_device_window_ms(),
            device_max_requests: default_device_max(),
        }
    }
}

// ─── Tools / security ─────────────────────────────────────────────────────────

fn default_tool_timeout_ms() -> u64 {
    60_000
}
fn default_confirm_timeout_ms() -> u64 {
    120_000
}
fn default_cooldown_ms() -> u64 {
    0
}
fn default_tool_rate_window_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_tool_timeout_ms")]
    pub timeout_ms: u64,
    /// Tool-name glob patterns that always run without confirmation.
    #[serde(default)]
    pub allow_patterns: Vec<String>,
    /// Tool-name glob patterns that require confirmation even at read level.
    #[serde(default)]
    pub confirm_patterns: Vec<String>,
    /// Tool-name glob patterns that are always denied.
    #[serde(default)]
    pub deny_patterns: Vec<String>,
    /// Require out-of-band confirmation for write/sign tools.
    #[serde(default = "default_true")]
    pub confirmation_enabled: bool,
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,
    /// Users allowed to approve confirmations.  Empty = the requesting user.
    #[serde(default)]
    pub approver_allowlist: Vec<String>,
    /// Default per-tool cooldown.  0 = disabled.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Per-tool cooldown overrides keyed by tool name.
    #[serde(default)]
    pub cooldowns: HashMap<String, u64>,
    /// Fixed-window cap on tool calls per session, all tools combined.
    /// 0 = disabled.
    #[serde(default)]
    pub rate_limit_max_calls: u32,
    #[serde(default = "default_tool_rate_window_ms")]
    pub rate_limit_window_ms: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_tool_timeout_ms(),
            allow_patterns: Vec::new(),
            confirm_patterns: Vec::new(),
            deny_patterns: Vec::new(),
            confirmation_enabled: true,
            confirm_timeout_ms: default_confirm_timeout_ms(),
            approver_allowlist: Vec::new(),
            cooldown_ms: default_cooldown_ms(),
            cooldowns: HashMap::new(),
            rate_limit_max_calls: 0,
            rate_limit_window_ms: default_tool_rate_window_ms(),
        }
    }
}

// ─── Session ──────────────────────────────────────────────────────────────────

fn default_max_turns() -> usize {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Turns of history loaded per model call.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// Run a one-shot summarization before `/new` rotates the session.
    #[serde(default = "default_true")]
    pub summarize_on_reset: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            summarize_on_reset: true,
        }
    }
}

// ─── Context guard ────────────────────────────────────────────────────────────

fn default_max_tool_result_chars() -> usize {
    16 * 1024
}
fn default_truncate_head_chars() -> usize {
    6 * 1024
}
fn default_truncate_tail_chars() -> usize {
    2 * 1024
}
fn default_reserve_tokens() -> usize {
    8 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "default_max_tool_result_chars")]
    pub max_tool_result_chars: usize,
    #[serde(default = "default_truncate_head_chars")]
    pub truncate_head_chars: usize,
    #[serde(default = "default_truncate_tail_chars")]
    pub truncate_tail_chars: usize,
    /// Headroom kept free below the context window for the reply.
    #[serde(default = "default_reserve_tokens")]
    pub reserve_tokens: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_tool_result_chars: default_max_tool_result_chars(),
            truncate_head_chars: default_truncate_head_chars(),
            truncate_tail_chars: default_truncate_tail_chars(),
            reserve_tokens: default_reserve_tokens(),
        }
    }
}

// ─── Inbound rate limit ───────────────────────────────────────────────────────

fn default_window_ms() -> u64 {
    60_000
}
fn default_max_messages() -> u32 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_messages: default_max_messages(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses_from_empty_yaml() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.agent.id, "main");
        assert_eq!(cfg.agent.max_iterations, 25);
        assert_eq!(cfg.agent.loop_timeout_ms, 120_000);
    }

    #[test]
    fn guard_defaults_match_budget() {
        let g = GuardConfig::default();
        assert_eq!(g.max_tool_result_chars, 16 * 1024);
        assert_eq!(g.reserve_tokens, 8 * 1024);
    }

    #[test]
    fn provider_list_preserves_order() {
        let cfg: Config = serde_yaml::from_str(
            "providers:\n  - id: a\n    model: m1\n    priority: 2\n  - id: b\n    model: m2\n    priority: 1\n",
        )
        .unwrap();
        assert_eq!(cfg.providers[0].id, "a");
        assert_eq!(cfg.providers[1].priority, 1);
    }

    #[test]
    fn cli_backend_defaults() {
        let cfg: CliBackendConfig =
            serde_yaml::from_str("command: claude").unwrap();
        assert_eq!(cfg.max_prompt_arg_chars, 32_768);
        assert_eq!(cfg.session_mode, CliSessionMode::Resume);
        assert_eq!(cfg.output, CliOutputFormat::Text);
        assert!(!cfg.serialize);
    }

    #[test]
    fn group_override_defaults_require_mention() {
        let o: GroupOverride = serde_yaml::from_str("{}").unwrap();
        assert!(o.enabled);
        assert!(o.require_mention);
        assert!(o.allow_from.is_empty());
    }

    #[test]
    fn gateway_defaults() {
        let g = GatewayConfig::default();
        assert_eq!(g.body_limit_bytes, 1024 * 1024);
        assert_eq!(g.poll_batch_size, 100);
        assert!(!g.enabled);
    }

    #[test]
    fn tools_confirmation_enabled_by_default() {
        let t = ToolsConfig::default();
        assert!(t.confirmation_enabled);
        assert_eq!(t.confirm_timeout_ms, 120_000);
        assert_eq!(t.rate_limit_max_calls, 0, "tool-call rate limit is opt-in");
        assert_eq!(t.rate_limit_window_ms, 60_000);
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.agent.id, cfg.agent.id);
        assert_eq!(back.session.max_turns, cfg.session.max_turns);
    }
}
