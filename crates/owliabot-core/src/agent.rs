// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agentic loop: model turns interleaved with gated tool execution.
//!
//! One run is bounded by an iteration cap and a wall-clock deadline, both
//! enforced through a shared cancellation signal that also reaches the
//! provider call and every in-flight tool.  The loop appends intermediate
//! tool rounds to the transcript itself; the final assistant message is
//! returned to the caller, which appends it after dispatching the reply.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use owliabot_model::{
    LlmResponse, Message, ProviderError, ProviderRunner, Role, RunOptions, StopReason,
    ToolResultRecord,
};
use owliabot_tools::{execute_tool_calls, ExecDeps, ToolContext};

use crate::{LoopEvent, TranscriptStore};

/// User-visible reply when the conversation no longer fits any window.
pub(crate) const NEW_SESSION_GUIDANCE: &str =
    "⚠️ The conversation no longer fits the model's context window. Send /new to start a fresh session.";

/// Dependencies for one loop run.
#[derive(Clone)]
pub struct LoopDeps {
    pub runner: Arc<ProviderRunner>,
    pub exec: ExecDeps,
    pub transcripts: Arc<TranscriptStore>,
}

#[derive(Clone)]
pub struct LoopOptions {
    pub max_iterations: u32,
    pub timeout: Duration,
    pub session_id: String,
    /// Telemetry channel; the loop never blocks on it.
    pub events: Option<mpsc::Sender<LoopEvent>>,
    /// External cancellation (request abort, shutdown).
    pub cancel: Option<watch::Receiver<bool>>,
    /// Provider tried first (per-session model override).
    pub preferred_provider: Option<String>,
}

impl LoopOptions {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            max_iterations: 25,
            timeout: Duration::from_secs(120),
            session_id: session_id.into(),
            events: None,
            cancel: None,
            preferred_provider: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoopOutcome {
    pub content: String,
    pub iterations: u32,
    pub tool_calls_count: u32,
    pub max_iterations_reached: bool,
    pub timed_out: bool,
    pub error: Option<String>,
}

/// Drive the model ↔ tool loop until a terminal assistant message.
pub async fn run_agentic_loop(
    mut messages: Vec<Message>,
    tool_ctx: &ToolContext,
    deps: &LoopDeps,
    opts: LoopOptions,
) -> LoopOutcome {
    // Shared cancellation: the deadline watchdog and any external signal both
    // flip the same flag, which is wired into the runner and every tool.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let cancel_tx = Arc::new(cancel_tx);
    let watchdog = {
        let tx = cancel_tx.clone();
        let timeout = opts.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(true);
        })
    };
    let forwarder = opts.cancel.clone().map(|mut external| {
        let tx = cancel_tx.clone();
        tokio::spawn(async move {
            if external.wait_for(|c| *c).await.is_ok() {
                let _ = tx.send(true);
            }
        })
    });

    let mut ctx = tool_ctx.clone();
    ctx.cancel = Some(cancel_rx.clone());

    let deadline = Instant::now() + opts.timeout;
    let tools = deps.exec.registry.schemas();
    let is_first_message = !messages.iter().any(|m| m.role == Role::Assistant);

    let mut outcome = LoopOutcome::default();
    let mut last_content = String::new();

    loop {
        if *cancel_rx.borrow() {
            outcome.timed_out = true;
            outcome.error = Some("loop timed out".into());
            break;
        }
        if outcome.iterations >= opts.max_iterations {
            outcome.max_iterations_reached = true;
            break;
        }
        outcome.iterations += 1;
        emit(&opts.events, LoopEvent::TurnStart {
            iteration: outcome.iterations,
        });

        let run_opts = RunOptions {
            tools: tools.clone(),
            session_key: Some(ctx.session_key.clone()),
            is_first_message: is_first_message && outcome.iterations == 1,
            preferred_provider: opts.preferred_provider.clone(),
            cancel: Some(cancel_rx.clone()),
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        let resp = match tokio::time::timeout(remaining, deps.runner.run(&messages, &run_opts))
            .await
        {
            Err(_) => {
                outcome.timed_out = true;
                outcome.error = Some("loop timed out".into());
                break;
            }
            Ok(Err(e)) => {
                apply_provider_error(&mut outcome, e);
                break;
            }
            Ok(Ok(r)) => r,
        };
        emit(&opts.events, LoopEvent::MessageStart);
        if !resp.content.is_empty() {
            last_content = resp.content.clone();
        }

        // Terminal turn: no tool calls, or an explicit stop/length reason.
        if resp.tool_calls.is_empty() || resp.stop_reason != StopReason::ToolUse {
            outcome.content = extract_final_content(&resp);
            break;
        }

        // Tool round: the assistant's call message and the synthetic result
        // message both land in the transcript before the next model turn.
        let assistant = Message::assistant_with_calls(&resp.content, resp.tool_calls.clone());
        if let Err(e) = deps.transcripts.append(&opts.session_id, &assistant).await {
            warn!(error = %e, "failed to append assistant tool-call message");
        }
        messages.push(assistant);

        for call in &resp.tool_calls {
            emit(&opts.events, LoopEvent::ToolExecutionStart {
                call_id: call.id.clone(),
                tool: call.name.clone(),
            });
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        let results = match tokio::time::timeout(
            remaining,
            execute_tool_calls(&resp.tool_calls, &deps.exec, &ctx),
        )
        .await
        {
            Err(_) => {
                outcome.timed_out = true;
                outcome.error = Some("loop timed out during tool execution".into());
                break;
            }
            Ok(r) => r,
        };

        let mut records = Vec::with_capacity(resp.tool_calls.len());
        for call in &resp.tool_calls {
            let result = results.get(&call.id).cloned().unwrap_or_else(|| {
                owliabot_tools::ToolResult::err("tool produced no result")
            });
            emit(&opts.events, LoopEvent::ToolExecutionEnd {
                call_id: call.id.clone(),
                tool: call.name.clone(),
                success: result.success,
            });
            records.push(ToolResultRecord {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                success: result.success,
                data: result.data,
                error: result.error,
            });
        }
        outcome.tool_calls_count += resp.tool_calls.len() as u32;

        let result_msg = Message::tool_results(records);
        if let Err(e) = deps.transcripts.append(&opts.session_id, &result_msg).await {
            warn!(error = %e, "failed to append tool-result message");
        }
        messages.push(result_msg);
    }

    if outcome.content.is_empty() && !last_content.is_empty() {
        outcome.content = last_content;
    }
    debug!(
        iterations = outcome.iterations,
        tool_calls = outcome.tool_calls_count,
        timed_out = outcome.timed_out,
        "agentic loop finished"
    );
    emit(&opts.events, LoopEvent::TurnComplete);
    watchdog.abort();
    if let Some(f) = forwarder {
        f.abort();
    }
    outcome
}

/// Final-content extraction for a terminal model turn.
fn extract_final_content(resp: &LlmResponse) -> String {
    if !resp.content.is_empty() {
        return resp.content.clone();
    }
    if resp.stop_reason == StopReason::Length {
        return NEW_SESSION_GUIDANCE.to_string();
    }
    String::new()
}

/// Map a runner error onto the outcome's user-visible content.
fn apply_provider_error(outcome: &mut LoopOutcome, e: ProviderError) {
    outcome.error = Some(e.to_string());
    outcome.content = match &e {
        ProviderError::ContextOverflow(_) => NEW_SESSION_GUIDANCE.to_string(),
        ProviderError::AuthMissing { .. } => format!("⚠️ {e}"),
        ProviderError::Cancelled => String::new(),
        _ => format!("⚠️ Processing failed: {e}"),
    };
}

fn emit(events: &Option<mpsc::Sender<LoopEvent>>, event: LoopEvent) {
    if let Some(tx) = events {
        let _ = tx.try_send(event);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use owliabot_config::{Config, ProviderConfig, ToolsConfig};
    use owliabot_model::{
        ChatContext, CompleteOptions, LlmResponse, ModelProvider, ScriptedMockProvider, ToolCall,
    };
    use owliabot_tools::{
        AuditLogger, CooldownTracker, PolicyEngine, SecurityLevel, Tool, ToolCallLimiter, ToolRegistry,
        ToolResult, ToolSecurity,
    };
    use serde_json::{json, Value};
    use std::collections::HashMap;

    struct CountTool;

    #[async_trait]
    impl Tool for CountTool {
        fn name(&self) -> &str {
            "counter"
        }
        fn description(&self) -> &str {
            "counts"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn security(&self) -> ToolSecurity {
            ToolSecurity {
                level: SecurityLevel::Read,
                confirm_required: false,
                max_value: None,
            }
        }
        async fn execute(&self, _args: &Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult::ok(json!("counted"))
        }
    }

    fn test_config(provider_ids: &[&str]) -> Arc<Config> {
        let mut cfg = Config::default();
        cfg.agent.state_dir = Some(std::env::temp_dir().join("owliabot-core-tests"));
        for (i, id) in provider_ids.iter().enumerate() {
            cfg.providers.push(ProviderConfig {
                id: id.to_string(),
                model: "m".into(),
                api_key: Some("k".into()),
                api_key_env: None,
                priority: i as u32,
                base_url: None,
                max_tokens: Some(128),
                temperature: None,
                context_window: Some(100_000),
                reasoning: None,
            });
        }
        Arc::new(cfg)
    }

    fn deps_with(
        script: Vec<Result<LlmResponse, ProviderError>>,
        transcripts: Arc<TranscriptStore>,
    ) -> LoopDeps {
        let cfg = test_config(&["mock"]);
        let mut drivers: HashMap<String, Arc<dyn ModelProvider>> = HashMap::new();
        drivers.insert("mock".into(), Arc::new(ScriptedMockProvider::new("mock", script)));
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(CountTool)).unwrap();
        let tools_cfg = ToolsConfig::default();
        LoopDeps {
            runner: Arc::new(ProviderRunner::with_drivers(cfg, drivers)),
            exec: ExecDeps {
                registry,
                policy: Arc::new(PolicyEngine::from_config(&tools_cfg)),
                audit: Arc::new(AuditLogger::in_memory()),
                cooldowns: Arc::new(CooldownTracker::from_config(&tools_cfg)),
                rate_limiter: Arc::new(ToolCallLimiter::from_config(&tools_cfg)),
                write_gate: None,
                tool_timeout: Duration::from_secs(5),
                confirmation_enabled: true,
            },
            transcripts,
        }
    }

    fn tool_call_response(n: usize) -> LlmResponse {
        let mut r = LlmResponse::text("mock", "m", "");
        r.stop_reason = StopReason::ToolUse;
        r.tool_calls = vec![ToolCall {
            id: format!("c{n}"),
            name: "counter".into(),
            arguments: json!({}),
        }];
        r
    }

    async fn fresh_store() -> (tempfile::TempDir, Arc<TranscriptStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TranscriptStore::open(dir.path()).unwrap());
        (dir, store)
    }

    #[tokio::test]
    async fn plain_reply_finishes_in_one_iteration() {
        let (_d, store) = fresh_store().await;
        let deps = deps_with(vec![Ok(LlmResponse::text("mock", "m", "hello"))], store.clone());
        let out = run_agentic_loop(
            vec![Message::user("hi")],
            &ToolContext::internal("test"),
            &deps,
            LoopOptions::new("s1"),
        )
        .await;
        assert_eq!(out.content, "hello");
        assert_eq!(out.iterations, 1);
        assert_eq!(out.tool_calls_count, 0);
        assert!(!out.timed_out && !out.max_iterations_reached);
        // Final assistant message is the caller's to append.
        assert!(store.read_all("s1").await.is_empty());
    }

    #[tokio::test]
    async fn tool_round_then_final_reply() {
        let (_d, store) = fresh_store().await;
        let deps = deps_with(
            vec![
                Ok(tool_call_response(1)),
                Ok(LlmResponse::text("mock", "m", "done")),
            ],
            store.clone(),
        );
        let out = run_agentic_loop(
            vec![Message::user("count please")],
            &ToolContext::internal("test"),
            &deps,
            LoopOptions::new("s1"),
        )
        .await;
        assert_eq!(out.content, "done");
        assert_eq!(out.iterations, 2);
        assert_eq!(out.tool_calls_count, 1);
        // The intermediate round (assistant call + results) is in the transcript.
        let transcript = store.read_all("s1").await;
        assert_eq!(transcript.len(), 2);
        assert!(transcript[0].has_tool_calls());
        assert!(transcript[1].has_tool_results());
        // One audit record per executed tool call.
        assert_eq!(deps.exec.audit.records().len(), 1);
    }

    #[tokio::test]
    async fn iteration_cap_is_enforced() {
        let (_d, store) = fresh_store().await;
        let script: Vec<_> = (0..10).map(|i| Ok(tool_call_response(i))).collect();
        let deps = deps_with(script, store);
        let mut opts = LoopOptions::new("s1");
        opts.max_iterations = 3;
        let out = run_agentic_loop(
            vec![Message::user("loop forever")],
            &ToolContext::internal("test"),
            &deps,
            opts,
        )
        .await;
        assert!(out.max_iterations_reached);
        assert_eq!(out.iterations, 3);
        assert_eq!(out.tool_calls_count, 3);
    }

    #[tokio::test]
    async fn provider_error_surfaces_failure_sentinel() {
        let (_d, store) = fresh_store().await;
        let deps = deps_with(
            vec![Err(ProviderError::Transient {
                status: 503,
                message: "overloaded".into(),
            })],
            store,
        );
        let out = run_agentic_loop(
            vec![Message::user("hi")],
            &ToolContext::internal("test"),
            &deps,
            LoopOptions::new("s1"),
        )
        .await;
        assert!(out.content.starts_with("⚠️ Processing failed: "), "{}", out.content);
        assert!(out.error.is_some());
    }

    #[tokio::test]
    async fn context_overflow_returns_new_session_guidance() {
        let (_d, store) = fresh_store().await;
        let overflow = || Err(ProviderError::ContextOverflow("prompt is too long".into()));
        let deps = deps_with(vec![overflow(), overflow(), overflow()], store);
        let out = run_agentic_loop(
            vec![Message::user("hi")],
            &ToolContext::internal("test"),
            &deps,
            LoopOptions::new("s1"),
        )
        .await;
        assert_eq!(out.content, NEW_SESSION_GUIDANCE);
    }

    #[tokio::test]
    async fn empty_length_reply_returns_new_session_guidance() {
        let (_d, store) = fresh_store().await;
        let mut resp = LlmResponse::text("mock", "m", "");
        resp.stop_reason = StopReason::Length;
        resp.truncated = true;
        let deps = deps_with(vec![Ok(resp)], store);
        let out = run_agentic_loop(
            vec![Message::user("hi")],
            &ToolContext::internal("test"),
            &deps,
            LoopOptions::new("s1"),
        )
        .await;
        assert_eq!(out.content, NEW_SESSION_GUIDANCE);
    }

    #[tokio::test]
    async fn wall_clock_timeout_stops_the_loop() {
        struct StallingProvider;
        #[async_trait]
        impl ModelProvider for StallingProvider {
            fn id(&self) -> &str {
                "stall"
            }
            async fn complete(
                &self,
                _model: &str,
                _ctx: &ChatContext,
                _opts: &CompleteOptions,
            ) -> Result<LlmResponse, ProviderError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(LlmResponse::text("stall", "m", "late"))
            }
        }

        let (_d, store) = fresh_store().await;
        let cfg = test_config(&["stall"]);
        let mut drivers: HashMap<String, Arc<dyn ModelProvider>> = HashMap::new();
        drivers.insert("stall".into(), Arc::new(StallingProvider));
        let registry = Arc::new(ToolRegistry::new());
        let tools_cfg = ToolsConfig::default();
        let deps = LoopDeps {
            runner: Arc::new(ProviderRunner::with_drivers(cfg, drivers)),
            exec: ExecDeps {
                registry,
                policy: Arc::new(PolicyEngine::from_config(&tools_cfg)),
                audit: Arc::new(AuditLogger::in_memory()),
                cooldowns: Arc::new(CooldownTracker::from_config(&tools_cfg)),
                rate_limiter: Arc::new(ToolCallLimiter::from_config(&tools_cfg)),
                write_gate: None,
                tool_timeout: Duration::from_secs(5),
                confirmation_enabled: true,
            },
            transcripts: store,
        };
        let mut opts = LoopOptions::new("s1");
        opts.timeout = Duration::from_millis(150);
        let started = Instant::now();
        let out = run_agentic_loop(
            vec![Message::user("hi")],
            &ToolContext::internal("test"),
            &deps,
            opts,
        )
        .await;
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn external_cancel_stops_the_loop() {
        let (_d, store) = fresh_store().await;
        let deps = deps_with(vec![Err(ProviderError::Cancelled)], store);
        let (tx, rx) = watch::channel(true);
        let mut opts = LoopOptions::new("s1");
        opts.cancel = Some(rx);
        let out = run_agentic_loop(
            vec![Message::user("hi")],
            &ToolContext::internal("test"),
            &deps,
            opts,
        )
        .await;
        drop(tx);
        assert!(out.error.is_some());
        assert!(out.content.is_empty());
    }

    #[tokio::test]
    async fn events_are_emitted_in_order() {
        let (_d, store) = fresh_store().await;
        let deps = deps_with(
            vec![
                Ok(tool_call_response(1)),
                Ok(LlmResponse::text("mock", "m", "done")),
            ],
            store,
        );
        let (tx, mut rx) = mpsc::channel(64);
        let mut opts = LoopOptions::new("s1");
        opts.events = Some(tx);
        run_agentic_loop(
            vec![Message::user("go")],
            &ToolContext::internal("test"),
            &deps,
            opts,
        )
        .await;
        let mut kinds = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            kinds.push(match ev {
                LoopEvent::TurnStart { .. } => "turn_start",
                LoopEvent::MessageStart => "message_start",
                LoopEvent::ToolExecutionStart { .. } => "tool_start",
                LoopEvent::ToolExecutionEnd { .. } => "tool_end",
                LoopEvent::TurnComplete => "turn_complete",
            });
        }
        assert_eq!(
            kinds,
            vec![
                "turn_start",
                "message_start",
                "tool_start",
                "tool_end",
                "turn_start",
                "message_start",
                "turn_complete",
            ]
        );
    }
}
