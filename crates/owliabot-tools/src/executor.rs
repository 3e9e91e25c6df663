// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Gated tool executor.
//!
//! One call flows lookup → policy → rate limit → cooldown → confirmation →
//! invoke → audit.  Denial and error paths never execute the tool, and every path
//! closes exactly one audit record with a terminal status.  Fan-out over a
//! turn's tool calls runs concurrently; all results are collected before the
//! loop issues the next model turn.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tracing::warn;

use owliabot_model::ToolCall;

use crate::{
    AuditLogger, AuditStatus, CooldownTracker, PolicyAction, PolicyEngine, ToolCallLimiter,
    ToolContext, ToolResult, ToolRegistry,
};
use crate::audit::AuditOutcome;

/// Confirmation request handed to the write gate.
#[derive(Debug, Clone)]
pub struct GateRequest {
    pub tool: String,
    pub arguments: Value,
    pub channel: String,
    /// Origin conversation the prompt is sent to.
    pub chat_id: String,
    pub from_user_id: String,
    pub session_key: String,
    /// Channel override from the policy decision, when present.
    pub confirmation_channel: Option<String>,
}

/// Result of a confirmation round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Approved { decision: String },
    Rejected { decision: String },
    TimedOut,
}

/// Out-of-band confirmation seam; implemented over the origin channel.
#[async_trait]
pub trait WriteGate: Send + Sync {
    async fn check(&self, req: &GateRequest) -> GateOutcome;
}

/// Dependencies threaded into every execution.
#[derive(Clone)]
pub struct ExecDeps {
    pub registry: Arc<ToolRegistry>,
    pub policy: Arc<PolicyEngine>,
    pub audit: Arc<AuditLogger>,
    pub cooldowns: Arc<CooldownTracker>,
    pub rate_limiter: Arc<ToolCallLimiter>,
    pub write_gate: Option<Arc<dyn WriteGate>>,
    pub tool_timeout: Duration,
    pub confirmation_enabled: bool,
}

/// Execute one tool call through the full gate pipeline.
pub async fn execute_tool_call(
    call: &ToolCall,
    deps: &ExecDeps,
    ctx: &ToolContext,
) -> ToolResult {
    let audit_id = deps.audit.pre_log(&call.name, &call.arguments, ctx);
    let started = Instant::now();
    let elapsed = |s: Instant| Some(s.elapsed().as_millis() as u64);

    // 1. Lookup.
    let Some(tool) = deps.registry.get(&call.name) else {
        deps.audit.finalize(
            &audit_id,
            AuditStatus::ToolNotFound,
            AuditOutcome {
                duration_ms: elapsed(started),
                result: Some("tool_not_found".into()),
                ..AuditOutcome::default()
            },
        );
        return ToolResult::err(format!("Tool not found: {}", call.name));
    };
    let security = tool.security();

    // 2. Policy.
    let decision = deps.policy.decide(&call.name, &call.arguments, &security);
    match decision.action {
        PolicyAction::Deny => {
            let reason = decision.reason.clone().unwrap_or_else(|| "policy_deny".into());
            deps.audit.finalize(
                &audit_id,
                AuditStatus::Denied,
                AuditOutcome {
                    duration_ms: elapsed(started),
                    gate: Some("policy".into()),
                    gate_decision: Some(reason.clone()),
                    result: Some("denied".into()),
                },
            );
            return ToolResult::err(format!("Tool call denied by policy: {reason}"));
        }
        PolicyAction::Escalate => {
            // Surfaced to the caller as a denial; a higher-trust signer path
            // may pick it up from the audit stream.  Never executed here.
            deps.audit.finalize(
                &audit_id,
                AuditStatus::Denied,
                AuditOutcome {
                    duration_ms: elapsed(started),
                    gate: Some("policy".into()),
                    gate_decision: Some("escalation_required".into()),
                    result: Some("denied".into()),
                },
            );
            return ToolResult::err(format!(
                "Tool call denied: '{}' requires escalation to a higher signer tier",
                call.name
            ));
        }
        PolicyAction::Allow | PolicyAction::Confirm => {}
    }

    // 3. Per-session tool-call rate limit.
    let rate = deps.rate_limiter.check(&ctx.session_key);
    if !rate.allowed {
        deps.audit.finalize(
            &audit_id,
            AuditStatus::RateLimited,
            AuditOutcome {
                duration_ms: elapsed(started),
                gate: Some("rate_limit".into()),
                gate_decision: Some("rate_limited".into()),
                result: Some("denied".into()),
            },
        );
        return ToolResult::err(format!(
            "Tool call rate limit exceeded; retry in {}s",
            rate.retry_after_ms.div_ceil(1000)
        ));
    }

    // 4. Cooldown.
    let cooldown = deps.cooldowns.check(&call.name, &ctx.session_key);
    if !cooldown.allowed {
        deps.audit.finalize(
            &audit_id,
            AuditStatus::Cooldown,
            AuditOutcome {
                duration_ms: elapsed(started),
                gate: Some("cooldown".into()),
                gate_decision: Some("cooldown".into()),
                result: Some("denied".into()),
            },
        );
        return ToolResult::err(format!(
            "Tool '{}' is cooling down; retry in {}s",
            call.name,
            cooldown.retry_after_ms.div_ceil(1000)
        ));
    }

    // 5. Confirmation for write/sign operations.
    let mut gate_used = None;
    let mut gate_decision = None;
    let needs_confirmation = security.level.is_gated()
        && (deps.confirmation_enabled
            || decision.action == PolicyAction::Confirm
            || security.confirm_required);
    if needs_confirmation {
        let Some(gate) = &deps.write_gate else {
            // No gate wired for a gated operation: fail closed.
            deps.audit.finalize(
                &audit_id,
                AuditStatus::Denied,
                AuditOutcome {
                    duration_ms: elapsed(started),
                    gate: Some("write_gate".into()),
                    gate_decision: Some("no_gate_available".into()),
                    result: Some("denied".into()),
                },
            );
            return ToolResult::err(format!(
                "Tool '{}' requires confirmation but no confirmation channel is available",
                call.name
            ));
        };
        let request = GateRequest {
            tool: call.name.clone(),
            arguments: call.arguments.clone(),
            channel: ctx.channel.clone(),
            chat_id: ctx.chat_id.clone(),
            from_user_id: ctx.user_id.clone(),
            session_key: ctx.session_key.clone(),
            confirmation_channel: decision.confirmation_channel.clone(),
        };
        match gate.check(&request).await {
            GateOutcome::Approved { decision } => {
                gate_used = Some("write_gate".to_string());
                gate_decision = Some(decision);
            }
            GateOutcome::Rejected { decision } => {
                deps.audit.finalize(
                    &audit_id,
                    AuditStatus::Denied,
                    AuditOutcome {
                        duration_ms: elapsed(started),
                        gate: Some("write_gate".into()),
                        gate_decision: Some(decision.clone()),
                        result: Some("denied".into()),
                    },
                );
                return ToolResult::err(format!("Tool call rejected: {decision}"));
            }
            GateOutcome::TimedOut => {
                deps.audit.finalize(
                    &audit_id,
                    AuditStatus::Denied,
                    AuditOutcome {
                        duration_ms: elapsed(started),
                        gate: Some("write_gate".into()),
                        gate_decision: Some("timeout".into()),
                        result: Some("denied".into()),
                    },
                );
                return ToolResult::err("Confirmation timed out".to_string());
            }
        }
    }

    // 6. Invoke under the per-tool timeout; panics become error values.
    let invocation = AssertUnwindSafe(tool.execute(&call.arguments, ctx)).catch_unwind();
    let result = match tokio::time::timeout(deps.tool_timeout, invocation).await {
        Err(_) => ToolResult::err(format!(
            "Tool '{}' timed out after {}ms",
            call.name,
            deps.tool_timeout.as_millis()
        )),
        Ok(Err(_)) => {
            warn!(tool = %call.name, "tool panicked during execution");
            ToolResult::err(format!("Tool '{}' failed unexpectedly", call.name))
        }
        Ok(Ok(result)) => result,
    };

    // 7. Successful runs arm the cooldown.
    if result.success {
        deps.cooldowns.record(&call.name, &ctx.session_key);
    }

    // 8. Finalize.
    let status = if result.success {
        AuditStatus::Success
    } else {
        AuditStatus::Error
    };
    deps.audit.finalize(
        &audit_id,
        status,
        AuditOutcome {
            duration_ms: elapsed(started),
            gate: gate_used,
            gate_decision,
            result: Some(if result.success {
                "success".to_string()
            } else {
                result.error.clone().unwrap_or_else(|| "error".into())
            }),
        },
    );
    result
}

/// Run a batch of tool calls concurrently and collect results by call id.
///
/// Ordering between peers is not promised; completion of the whole batch is.
pub async fn execute_tool_calls(
    calls: &[ToolCall],
    deps: &ExecDeps,
    ctx: &ToolContext,
) -> HashMap<String, ToolResult> {
    let futures: Vec<_> = calls
        .iter()
        .map(|call| async move { (call.id.clone(), execute_tool_call(call, deps, ctx).await) })
        .collect();
    futures::future::join_all(futures).await.into_iter().collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
