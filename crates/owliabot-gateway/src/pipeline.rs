// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Gateway pipeline: the orchestration run once per inbound message.
//!
//! Order of gates: reply-router consumption, activation, idempotency,
//! typing indicator (scoped), rate limit, slash commands, session +
//! transcript, agentic loop, reply dispatch, event log.  The typing guard
//! is released on every exit path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use owliabot_channels::{Channel, ChatKind, InboundMessage, ReplyRouter};
use owliabot_config::Config;
use owliabot_core::{
    run_agentic_loop, ChatType, LoopDeps, LoopOptions, Session, SessionKey, SessionMeta,
    SessionStore, TranscriptStore,
};
use owliabot_model::{Message, ProviderRunner};
use owliabot_tools::{ExecDeps, ToolContext};

use crate::commands::{try_handle_command, CommandDeps};
use crate::{should_handle_message, InfraStore};

/// Assembles the system prompt for one message (workspace + persona +
/// memory + time live behind this seam).
pub trait PromptBuilder: Send + Sync {
    fn build(&self, msg: &InboundMessage, session: &Session) -> String;
}

/// Minimal built-in prompt: identity, workspace, current time.
pub struct DefaultPromptBuilder {
    pub agent_id: String,
    pub workspace: Option<std::path::PathBuf>,
}

impl PromptBuilder for DefaultPromptBuilder {
    fn build(&self, msg: &InboundMessage, _session: &Session) -> String {
        let mut prompt = format!(
            "You are OwliaBot (agent '{}'), a helpful assistant reachable over {}.",
            self.agent_id, msg.channel
        );
        if let Some(ws) = &self.workspace {
            prompt.push_str(&format!("\nWorkspace: {}", ws.display()));
        }
        prompt.push_str(&format!(
            "\nCurrent time: {}",
            Utc::now().format("%Y-%m-%d %H:%M UTC")
        ));
        prompt
    }
}

/// Everything the pipeline needs, built once at startup.
#[derive(Clone)]
pub struct GatewayDeps {
    pub config: Arc<Config>,
    pub channels: HashMap<String, Arc<dyn Channel>>,
    pub router: ReplyRouter,
    pub sessions: Arc<SessionStore>,
    pub transcripts: Arc<TranscriptStore>,
    pub infra: Arc<InfraStore>,
    pub runner: Arc<ProviderRunner>,
    pub exec: ExecDeps,
    pub prompt_builder: Arc<dyn PromptBuilder>,
}

pub struct Gateway {
    deps: GatewayDeps,
}

/// Turns the typing indicator off on every exit path.
struct TypingGuard {
    channel: Option<Arc<dyn Channel>>,
    chat_id: String,
}

impl TypingGuard {
    async fn on(channel: Option<Arc<dyn Channel>>, chat_id: &str) -> Self {
        if let Some(ch) = &channel {
            let _ = ch.typing(chat_id, true).await;
        }
        Self {
            channel,
            chat_id: chat_id.to_string(),
        }
    }
}

impl Drop for TypingGuard {
    fn drop(&mut self) {
        if let Some(ch) = self.channel.take() {
            let chat_id = std::mem::take(&mut self.chat_id);
            tokio::spawn(async move {
                let _ = ch.typing(&chat_id, false).await;
            });
        }
    }
}

impl Gateway {
    pub fn new(deps: GatewayDeps) -> Self {
        Self { deps }
    }

    pub fn deps(&self) -> &GatewayDeps {
        &self.deps
    }

    /// Process one inbound message end to end.
    pub async fn handle_inbound(&self, msg: InboundMessage) -> anyhow::Result<()> {
        let d = &self.deps;
        let now = Utc::now();
        d.infra.cleanup(now);

        // A reply consumed by a pending write-gate waiter never reaches the
        // pipeline proper.
        if d.router.dispatch(&msg) {
            return Ok(());
        }

        // 1. Activation.
        if !should_handle_message(&msg, &d.config.channels) {
            debug!(channel = %msg.channel, from = %msg.from, "message not activated");
            return Ok(());
        }

        // 2. Idempotency: duplicate deliveries within TTL are dropped.
        let idem_key = format!("msg:{}:{}", msg.channel, msg.message_id);
        let request_hash = hash_request(&msg.channel, &msg.message_id, &msg.body);
        if let Some(existing) = d.infra.get_idempotency(&idem_key, now) {
            if existing.request_hash == request_hash {
                info!(key = %idem_key, "duplicate delivery dropped");
                return Ok(());
            }
        }
        let ttl = ChronoDuration::milliseconds(d.config.gateway.idempotency_ttl_ms as i64);
        d.infra
            .save_idempotency(&idem_key, &request_hash, "processing", now + ttl)?;

        // 3. Typing indicator, released on all paths.
        let channel = d.channels.get(&msg.channel).cloned();
        let _typing = TypingGuard::on(channel.clone(), &msg.chat_id).await;

        // 4. Rate limit.
        let bucket = format!("user:{}:{}", msg.channel, msg.from);
        let rl = d.infra.check_rate_limit(
            &bucket,
            d.config.rate_limit.window_ms,
            d.config.rate_limit.max_messages,
            now,
        );
        if !rl.allowed {
            let wait_secs = (rl.reset_at - now).num_seconds().max(1);
            let reply = format!("⏳ Slow down, retry in {wait_secs} seconds.");
            self.send_reply(&msg, &reply).await;
            d.infra.insert_event(
                "rate_limit",
                "warning",
                &msg.channel,
                &format!("rate limit hit for {bucket}"),
                json!({ "bucket": bucket }),
                d.config.gateway.event_ttl_ms,
            );
            return Ok(());
        }

        // 5. Slash commands short-circuit the loop.
        let key = session_key_for(&d.config.agent.id, &msg);
        let meta = session_meta_for(&msg);
        let command_reply = try_handle_command(
            &msg.body,
            &key,
            &meta,
            CommandDeps {
                config: &d.config,
                sessions: &d.sessions,
                transcripts: &d.transcripts,
                infra: &d.infra,
                runner: &d.runner,
            },
        )
        .await;
        if let Some(reply) = command_reply {
            self.send_reply(&msg, &reply).await;
            let _ = d
                .infra
                .save_idempotency(&idem_key, &request_hash, &reply, now + ttl);
            return Ok(());
        }

        // 6. Session + transcript.
        let session = d.sessions.get_or_create(&key, &meta).await;
        d.transcripts
            .append(&session.session_id, &Message::user(&msg.body))
            .await?;

        // 7. System prompt + history.
        let system_prompt = d.prompt_builder.build(&msg, &session);
        let mut messages = vec![Message::system(system_prompt)];
        messages.extend(
            d.transcripts
                .get_history(&session.session_id, d.config.session.max_turns)
                .await,
        );

        // 8. Agentic loop.
        let tool_ctx = ToolContext {
            session_key: key.as_str().to_string(),
            agent_id: d.config.agent.id.clone(),
            channel: msg.channel.clone(),
            chat_id: msg.chat_id.clone(),
            user_id: msg.from.clone(),
            workspace_path: d.config.agent.workspace.clone(),
            cancel: None,
            config: d.config.clone(),
        };
        let loop_deps = LoopDeps {
            runner: d.runner.clone(),
            exec: d.exec.clone(),
            transcripts: d.transcripts.clone(),
        };
        let mut loop_opts = LoopOptions::new(&session.session_id);
        loop_opts.max_iterations = d.config.agent.max_iterations;
        loop_opts.timeout = Duration::from_millis(d.config.agent.loop_timeout_ms);
        loop_opts.preferred_provider = session.primary_model_override.clone();
        let outcome = run_agentic_loop(messages, &tool_ctx, &loop_deps, loop_opts).await;

        let reply = if outcome.content.is_empty() {
            "⚠️ Processing failed: no response produced".to_string()
        } else {
            outcome.content.clone()
        };

        // 9. Append the final assistant message, reply on the same channel.
        d.transcripts
            .append(&session.session_id, &Message::assistant(&reply))
            .await?;
        d.sessions.touch(&key, 2).await;
        self.send_reply(&msg, &reply).await;

        // 10. Event log: status from the failure sentinel.
        let status = if reply.starts_with("⚠️") { "error" } else { "ok" };
        d.infra.insert_event(
            "message.processed",
            status,
            &msg.channel,
            &format!("processed message {}", msg.message_id),
            json!({
                "session": session.session_id,
                "iterations": outcome.iterations,
                "tool_calls": outcome.tool_calls_count,
            }),
            d.config.gateway.event_ttl_ms,
        );
        let _ = d
            .infra
            .save_idempotency(&idem_key, &request_hash, &reply, now + ttl);
        Ok(())
    }

    async fn send_reply(&self, msg: &InboundMessage, text: &str) {
        let Some(channel) = self.deps.channels.get(&msg.channel) else {
            warn!(channel = %msg.channel, "no channel adapter to send reply");
            return;
        };
        if let Err(e) = channel.send(&msg.chat_id, text, Some(&msg.message_id)).await {
            warn!(channel = %msg.channel, error = %e, "failed to send reply");
        }
    }
}

fn session_key_for(agent_id: &str, msg: &InboundMessage) -> SessionKey {
    match (msg.chat_kind, &msg.group_id) {
        (ChatKind::Group, Some(g)) => SessionKey::group(agent_id, &msg.channel, g),
        _ => SessionKey::direct(agent_id, &msg.channel),
    }
}

fn session_meta_for(msg: &InboundMessage) -> SessionMeta {
    SessionMeta {
        channel: msg.channel.clone(),
        chat_type: match msg.chat_kind {
            ChatKind::Direct => ChatType::Direct,
            ChatKind::Group => ChatType::Group,
        },
        group_id: msg.group_id.clone(),
        display_name: msg.from_username.clone(),
    }
}

/// Request hash binding the idempotency record to the exact delivery.
pub(crate) fn hash_request(channel: &str, message_id: &str, body: &str) -> String {
    hex::encode(Sha256::digest(format!("{channel}|{message_id}|{body}").as_bytes()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
