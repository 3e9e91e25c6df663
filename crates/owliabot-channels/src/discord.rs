// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Discord transport backed by `serenity`.

use std::sync::Arc;

use async_trait::async_trait;
use serenity::all::{ChannelId, CreateMessage, GatewayIntents, Http, MessageId};
use serenity::client::{Context as SerenityContext, EventHandler};
use serenity::model::channel::Message as DiscordMessage;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::{Channel, ChatKind, InboundMessage};

pub struct DiscordChannel {
    http: Arc<Http>,
}

impl DiscordChannel {
    pub fn new(token: &str) -> Self {
        Self {
            http: Arc::new(Http::new(token)),
        }
    }
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send(
        &self,
        chat_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> anyhow::Result<()> {
        let channel = ChannelId::new(chat_id.parse()?);
        let mut builder = CreateMessage::new().content(text);
        if let Some(reply_id) = reply_to.and_then(|r| r.parse::<u64>().ok()) {
            builder = builder.reference_message((channel, MessageId::new(reply_id)));
        }
        channel.send_message(&self.http, builder).await?;
        Ok(())
    }

    async fn typing(&self, chat_id: &str, on: bool) -> anyhow::Result<()> {
        if !on {
            return Ok(());
        }
        let channel = ChannelId::new(chat_id.parse()?);
        channel.broadcast_typing(&self.http).await?;
        Ok(())
    }
}

struct Handler {
    tx: mpsc::Sender<InboundMessage>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn message(&self, _ctx: SerenityContext, msg: DiscordMessage) {
        if msg.author.bot {
            return;
        }
        let is_dm = msg.guild_id.is_none();
        let inbound = InboundMessage {
            channel: "discord".into(),
            message_id: msg.id.to_string(),
            chat_id: msg.channel_id.to_string(),
            from: msg.author.id.to_string(),
            from_username: Some(msg.author.name.clone()),
            chat_kind: if is_dm { ChatKind::Direct } else { ChatKind::Group },
            group_id: msg.guild_id.map(|g| g.to_string()),
            body: msg.content,
        };
        if self.tx.send(inbound).await.is_err() {
            warn!("discord listener: gateway receiver dropped");
        }
    }
}

/// Gateway listener forwarding messages as [`InboundMessage`]s.
pub async fn run_listener(token: &str, tx: mpsc::Sender<InboundMessage>) {
    let intents = GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;
    let mut client = match serenity::Client::builder(token, intents)
        .event_handler(Handler { tx })
        .await
    {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to build discord client");
            return;
        }
    };
    if let Err(e) = client.start().await {
        error!(error = %e, "discord client stopped");
    }
}
