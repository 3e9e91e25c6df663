// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

/// Conversation kind as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Direct,
    Group,
}

/// One inbound message normalized across transports.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Channel name: `telegram`, `discord`, `http`.
    pub channel: String,
    /// Transport-scoped message id (idempotency anchor).
    pub message_id: String,
    /// Chat/conversation id replies go back to.
    pub chat_id: String,
    /// Sender id as the transport reports it.
    pub from: String,
    /// `@username` where the transport has one.
    pub from_username: Option<String>,
    pub chat_kind: ChatKind,
    /// Group id for group chats.
    pub group_id: Option<String>,
    pub body: String,
}

impl InboundMessage {
    pub fn is_direct(&self) -> bool {
        self.chat_kind == ChatKind::Direct
    }
}

/// Outbound surface of a messaging transport.
///
/// Adapters are opaque: the gateway only sends text, toggles the typing
/// indicator, and receives [`InboundMessage`]s from the adapter's own
/// listener task.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Send `text` to `chat_id`, optionally as a reply to a prior message.
    async fn send(&self, chat_id: &str, text: &str, reply_to: Option<&str>)
        -> anyhow::Result<()>;

    /// Toggle the typing indicator.  Transports without one ignore this.
    async fn typing(&self, _chat_id: &str, _on: bool) -> anyhow::Result<()> {
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(kind: ChatKind) -> InboundMessage {
        InboundMessage {
            channel: "telegram".into(),
            message_id: "m1".into(),
            chat_id: "c1".into(),
            from: "u1".into(),
            from_username: None,
            chat_kind: kind,
            group_id: None,
            body: "hello".into(),
        }
    }

    #[test]
    fn direct_detection() {
        assert!(msg(ChatKind::Direct).is_direct());
        assert!(!msg(ChatKind::Group).is_direct());
    }
}
