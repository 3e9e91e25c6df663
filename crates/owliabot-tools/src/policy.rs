// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;
use serde_json::Value;

use owliabot_config::ToolsConfig;

use crate::{Tier, ToolSecurity};

/// What the executor should do with a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    /// Run without asking.
    Allow,
    /// Run only after out-of-band confirmation.
    Confirm,
    /// Surface to a higher-trust signer path; never executed here.
    Escalate,
    /// Never run.
    Deny,
}

/// Full decision for one call.
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    /// Tier derived from the tool's security level.
    pub tier: Tier,
    /// Signer tier for sign-level operations.
    pub signer_tier: Option<Tier>,
    pub reason: Option<String>,
    /// Channel that should carry the confirmation prompt, when overridden.
    pub confirmation_channel: Option<String>,
}

/// Policy engine mapping (tool name, arguments, security) to a decision.
///
/// Precedence: deny patterns > escalation (max_value) > confirm patterns >
/// allow patterns > level default (read allows, write/sign confirms).
#[derive(Debug)]
pub struct PolicyEngine {
    allow_patterns: Vec<Regex>,
    confirm_patterns: Vec<Regex>,
    deny_patterns: Vec<Regex>,
}

impl PolicyEngine {
    pub fn from_config(cfg: &ToolsConfig) -> Self {
        let compile = |patterns: &[String]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| glob_to_regex(p)).collect()
        };
        Self {
            allow_patterns: compile(&cfg.allow_patterns),
            confirm_patterns: compile(&cfg.confirm_patterns),
            deny_patterns: compile(&cfg.deny_patterns),
        }
    }

    pub fn decide(&self, name: &str, args: &Value, security: &ToolSecurity) -> PolicyDecision {
        let tier = security.level.tier();
        let signer_tier = matches!(security.level, crate::SecurityLevel::Sign).then_some(Tier::Tier1);

        if self.deny_patterns.iter().any(|re| re.is_match(name)) {
            return PolicyDecision {
                action: PolicyAction::Deny,
                tier,
                signer_tier,
                reason: Some("deny_pattern".into()),
                confirmation_channel: None,
            };
        }

        // A `value` argument above the tool's ceiling leaves this trust
        // domain entirely; the decision is surfaced, never executed.
        if let Some(max) = security.max_value {
            let value = args.get("value").and_then(Value::as_f64);
            if value.is_some_and(|v| v > max) {
                return PolicyDecision {
                    action: PolicyAction::Escalate,
                    tier,
                    signer_tier,
                    reason: Some("escalation_required".into()),
                    confirmation_channel: None,
                };
            }
        }

        if self.confirm_patterns.iter().any(|re| re.is_match(name)) {
            return PolicyDecision {
                action: PolicyAction::Confirm,
                tier,
                signer_tier,
                reason: Some("confirm_pattern".into()),
                confirmation_channel: None,
            };
        }

        if self.allow_patterns.iter().any(|re| re.is_match(name)) {
            return PolicyDecision {
                action: PolicyAction::Allow,
                tier,
                signer_tier,
                reason: Some("allow_pattern".into()),
                confirmation_channel: None,
            };
        }

        let action = if security.level.is_gated() || security.confirm_required {
            PolicyAction::Confirm
        } else {
            PolicyAction::Allow
        };
        PolicyDecision {
            action,
            tier,
            signer_tier,
            reason: None,
            confirmation_channel: None,
        }
    }
}

/// Convert a simple shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
