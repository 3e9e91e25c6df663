// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! WriteGate over the origin chat channel.
//!
//! A pending write/sign operation sends a confirmation prompt back to the
//! conversation it came from and waits for a reply from the requesting user.
//! Replies are matched case-insensitively against allow/deny word lists; a
//! non-matching reply re-arms the waiter until the deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use owliabot_channels::{Channel, ReplyRouter};
use owliabot_config::ToolsConfig;
use owliabot_tools::{GateOutcome, GateRequest, WriteGate};

const ALLOW_WORDS: &[&str] = &["yes", "y", "ok", "approve"];
const DENY_WORDS: &[&str] = &["no", "n", "deny", "cancel"];

pub struct ChannelWriteGate {
    channels: HashMap<String, Arc<dyn Channel>>,
    router: ReplyRouter,
    confirmation_enabled: bool,
    timeout: Duration,
    approver_allowlist: Vec<String>,
}

impl ChannelWriteGate {
    pub fn new(
        channels: HashMap<String, Arc<dyn Channel>>,
        router: ReplyRouter,
        cfg: &ToolsConfig,
    ) -> Self {
        Self {
            channels,
            router,
            confirmation_enabled: cfg.confirmation_enabled,
            timeout: Duration::from_millis(cfg.confirm_timeout_ms),
            approver_allowlist: cfg.approver_allowlist.clone(),
        }
    }

    fn prompt_text(req: &GateRequest) -> String {
        let mut args = req.arguments.to_string();
        if args.len() > 200 {
            let mut end = 200;
            while end > 0 && !args.is_char_boundary(end) {
                end -= 1;
            }
            args.truncate(end);
            args.push('…');
        }
        format!(
            "⚠️ Confirm running {}? Arguments: {}\nReply yes to approve, no to deny.",
            req.tool, args
        )
    }
}

#[async_trait]
impl WriteGate for ChannelWriteGate {
    async fn check(&self, req: &GateRequest) -> GateOutcome {
        if !self.confirmation_enabled {
            return GateOutcome::Approved {
                decision: "confirmation_disabled_allow".into(),
            };
        }

        // A requester who can never approve is denied without a prompt.
        if !self.approver_allowlist.is_empty()
            && !self.approver_allowlist.iter().any(|u| u == &req.from_user_id)
        {
            return GateOutcome::Rejected {
                decision: "not_in_allowlist".into(),
            };
        }

        let channel_name = req.confirmation_channel.as_deref().unwrap_or(&req.channel);
        let Some(channel) = self.channels.get(channel_name) else {
            warn!(channel = channel_name, "no channel available for confirmation");
            return GateOutcome::Rejected {
                decision: "no_confirmation_channel".into(),
            };
        };

        // Register before prompting so a fast reply cannot slip past.
        let mut pending = self
            .router
            .register(channel_name, &req.chat_id, &req.from_user_id);
        if let Err(e) = channel
            .send(&req.chat_id, &Self::prompt_text(req), None)
            .await
        {
            warn!(error = %e, "failed to send confirmation prompt");
            return GateOutcome::Rejected {
                decision: "prompt_send_failed".into(),
            };
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return GateOutcome::TimedOut;
            }
            let reply = match tokio::time::timeout(remaining, &mut pending.1).await {
                Err(_) => return GateOutcome::TimedOut,
                Ok(Err(_)) => return GateOutcome::TimedOut, // waiter dropped
                Ok(Ok(body)) => body,
            };
            let word = reply.trim().to_lowercase();
            if ALLOW_WORDS.contains(&word.as_str()) {
                debug!(tool = %req.tool, "confirmation approved");
                return GateOutcome::Approved {
                    decision: "approved_by_user".into(),
                };
            }
            if DENY_WORDS.contains(&word.as_str()) {
                return GateOutcome::Rejected {
                    decision: "rejected".into(),
                };
            }
            // Unrelated reply: re-arm a fresh waiter and keep waiting.  The
            // consumed waiter's guard is dropped by the reassignment.
            pending = self
                .router
                .register(channel_name, &req.chat_id, &req.from_user_id);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use owliabot_channels::{ChatKind, InboundMessage};
    use std::sync::Mutex;

    struct RecordingChannel {
        name: &'static str,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn name(&self) -> &str {
            self.name
        }
        async fn send(
            &self,
            _chat_id: &str,
            text: &str,
            _reply_to: Option<&str>,
        ) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn gate_with(
        cfg: &ToolsConfig,
        router: ReplyRouter,
    ) -> (Arc<RecordingChannel>, ChannelWriteGate) {
        let channel = Arc::new(RecordingChannel {
            name: "telegram",
            sent: Mutex::new(Vec::new()),
        });
        let mut channels: HashMap<String, Arc<dyn Channel>> = HashMap::new();
        channels.insert("telegram".into(), channel.clone());
        (channel, ChannelWriteGate::new(channels, router, cfg))
    }

    fn request() -> GateRequest {
        GateRequest {
            tool: "todo__add".into(),
            arguments: serde_json::json!({"text": "x"}),
            channel: "telegram".into(),
            chat_id: "c1".into(),
            from_user_id: "u1".into(),
            session_key: "s".into(),
            confirmation_channel: None,
        }
    }

    fn reply(body: &str) -> InboundMessage {
        InboundMessage {
            channel: "telegram".into(),
            message_id: "m2".into(),
            chat_id: "c1".into(),
            from: "u1".into(),
            from_username: None,
            chat_kind: ChatKind::Direct,
            group_id: None,
            body: body.into(),
        }
    }

    #[tokio::test]
    async fn disabled_confirmation_is_open_gate() {
        let cfg = ToolsConfig {
            confirmation_enabled: false,
            ..ToolsConfig::default()
        };
        let (channel, gate) = gate_with(&cfg, ReplyRouter::new());
        let outcome = gate.check(&request()).await;
        assert_eq!(
            outcome,
            GateOutcome::Approved {
                decision: "confirmation_disabled_allow".into()
            }
        );
        assert!(channel.sent.lock().unwrap().is_empty(), "no prompt sent");
    }

    #[tokio::test]
    async fn requester_outside_allowlist_is_denied_without_prompt() {
        // No confirmation message may reach the channel.
        let cfg = ToolsConfig {
            approver_allowlist: vec!["admin".into()],
            ..ToolsConfig::default()
        };
        let (channel, gate) = gate_with(&cfg, ReplyRouter::new());
        let outcome = gate.check(&request()).await;
        assert_eq!(
            outcome,
            GateOutcome::Rejected {
                decision: "not_in_allowlist".into()
            }
        );
        assert!(channel.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn yes_reply_approves() {
        let cfg = ToolsConfig::default();
        let router = ReplyRouter::new();
        let (channel, gate) = gate_with(&cfg, router.clone());
        let check = tokio::spawn(async move { gate.check(&request()).await });
        // Wait for the prompt, then answer.
        for _ in 0..50 {
            if router.pending_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(router.dispatch(&reply("  YES ")));
        let outcome = check.await.unwrap();
        assert_eq!(
            outcome,
            GateOutcome::Approved {
                decision: "approved_by_user".into()
            }
        );
        assert_eq!(channel.sent.lock().unwrap().len(), 1, "one prompt sent");
    }

    #[tokio::test]
    async fn cancel_reply_rejects() {
        let cfg = ToolsConfig::default();
        let router = ReplyRouter::new();
        let (_channel, gate) = gate_with(&cfg, router.clone());
        let check = tokio::spawn(async move { gate.check(&request()).await });
        for _ in 0..50 {
            if router.pending_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(router.dispatch(&reply("cancel")));
        assert_eq!(
            check.await.unwrap(),
            GateOutcome::Rejected {
                decision: "rejected".into()
            }
        );
    }

    #[tokio::test]
    async fn no_reply_times_out() {
        let cfg = ToolsConfig {
            confirm_timeout_ms: 50,
            ..ToolsConfig::default()
        };
        let (_channel, gate) = gate_with(&cfg, ReplyRouter::new());
        assert_eq!(gate.check(&request()).await, GateOutcome::TimedOut);
    }

    #[tokio::test]
    async fn missing_channel_rejects() {
        let cfg = ToolsConfig::default();
        let gate = ChannelWriteGate::new(HashMap::new(), ReplyRouter::new(), &cfg);
        assert_eq!(
            gate.check(&request()).await,
            GateOutcome::Rejected {
                decision: "no_confirmation_channel".into()
            }
        );
    }
}
