// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Telegram transport backed by `teloxide`.

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, ChatId, MessageId, ReplyParameters};
use tokio::sync::mpsc;
use tracing::warn;

use crate::{Channel, ChatKind, InboundMessage};

pub struct TelegramChannel {
    bot: Bot,
}

impl TelegramChannel {
    pub fn new(token: &str) -> Self {
        Self {
            bot: Bot::new(token),
        }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(
        &self,
        chat_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> anyhow::Result<()> {
        let chat = ChatId(chat_id.parse()?);
        let mut request = self.bot.send_message(chat, text);
        if let Some(reply_id) = reply_to.and_then(|r| r.parse::<i32>().ok()) {
            request = request.reply_parameters(ReplyParameters::new(MessageId(reply_id)));
        }
        request.await?;
        Ok(())
    }

    async fn typing(&self, chat_id: &str, on: bool) -> anyhow::Result<()> {
        if !on {
            // Telegram typing expires on its own; there is no explicit off.
            return Ok(());
        }
        let chat = ChatId(chat_id.parse()?);
        self.bot.send_chat_action(chat, ChatAction::Typing).await?;
        Ok(())
    }
}

/// Long-polling listener forwarding updates as [`InboundMessage`]s.
pub async fn run_listener(bot: Bot, tx: mpsc::Sender<InboundMessage>) {
    teloxide::repl(bot, move |msg: Message| {
        let tx = tx.clone();
        async move {
            let Some(text) = msg.text() else {
                return Ok(());
            };
            let chat_kind = if msg.chat.is_private() {
                ChatKind::Direct
            } else {
                ChatKind::Group
            };
            let inbound = InboundMessage {
                channel: "telegram".into(),
                message_id: msg.id.0.to_string(),
                chat_id: msg.chat.id.0.to_string(),
                from: msg
                    .from
                    .as_ref()
                    .map(|u| u.id.0.to_string())
                    .unwrap_or_default(),
                from_username: msg.from.as_ref().and_then(|u| u.username.clone()),
                chat_kind,
                group_id: (chat_kind == ChatKind::Group).then(|| msg.chat.id.0.to_string()),
                body: text.to_string(),
            };
            if tx.send(inbound).await.is_err() {
                warn!("telegram listener: gateway receiver dropped");
            }
            Ok(())
        }
    })
    .await;
}
