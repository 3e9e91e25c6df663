// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use owliabot_config::Config;

/// Sensitivity class of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    #[default]
    Read,
    Write,
    Sign,
}

/// Signer tier derived from the security level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    None,
    Tier3,
    Tier1,
}

impl SecurityLevel {
    pub fn tier(self) -> Tier {
        match self {
            SecurityLevel::Read => Tier::None,
            SecurityLevel::Write => Tier::Tier3,
            SecurityLevel::Sign => Tier::Tier1,
        }
    }

    /// Write and sign operations go through the confirmation gate.
    pub fn is_gated(self) -> bool {
        matches!(self, SecurityLevel::Write | SecurityLevel::Sign)
    }
}

/// Security descriptor attached to a tool definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolSecurity {
    pub level: SecurityLevel,
    /// Force confirmation even when policy would allow.
    #[serde(default)]
    pub confirm_required: bool,
    /// Upper bound on a `value` argument; above it the call escalates.
    pub max_value: Option<f64>,
}

/// The outcome of one tool execution.
///
/// Recoverable failures are values (`success = false`), never panics or
/// `Err` propagation into the agent loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(data: impl Into<Value>) -> Self {
        Self {
            success: true,
            data: Some(data.into()),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Borrowed, immutable context handed to every tool invocation.
#[derive(Clone)]
pub struct ToolContext {
    pub session_key: String,
    pub agent_id: String,
    pub channel: String,
    /// Origin conversation id; confirmation prompts go back here.
    pub chat_id: String,
    pub user_id: String,
    pub workspace_path: Option<PathBuf>,
    /// Shared cancellation signal; long-running tools should watch it.
    pub cancel: Option<tokio::sync::watch::Receiver<bool>>,
    pub config: Arc<Config>,
}

impl ToolContext {
    /// Minimal context for tests and internal invocations.
    pub fn internal(channel: impl Into<String>) -> Self {
        Self {
            session_key: String::new(),
            agent_id: "main".into(),
            channel: channel.into(),
            chat_id: String::new(),
            user_id: String::new(),
            workspace_path: None,
            cancel: None,
            config: Arc::new(Config::default()),
        }
    }
}

/// Trait every registered tool implements.
///
/// `execute` must not panic for recoverable errors and must finish within
/// the executor's per-tool timeout; the executor enforces both.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the parameters object.
    fn parameters_schema(&self) -> Value;
    fn security(&self) -> ToolSecurity;
    async fn execute(&self, args: &Value, ctx: &ToolContext) -> ToolResult;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
