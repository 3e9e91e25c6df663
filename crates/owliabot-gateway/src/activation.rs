// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Activation gating: should this inbound message get a response at all?
//!
//! Decision order: per-channel user allowlist, then DMs always pass, then
//! group rules (mention patterns, per-group Telegram overrides, Discord
//! channel allowlist, global fallback).

use regex::Regex;

use owliabot_channels::{ChatKind, InboundMessage};
use owliabot_config::{ChannelsConfig, GroupActivation};

/// Decide whether the gateway pipeline should handle `msg`.
pub fn should_handle_message(msg: &InboundMessage, cfg: &ChannelsConfig) -> bool {
    // 1. User allowlist (set ⇒ sender must match, regardless of mention).
    let allow_list: &[String] = match (msg.channel.as_str(), msg.chat_kind) {
        ("telegram", ChatKind::Direct) => &cfg.telegram.allow_list,
        ("telegram", ChatKind::Group) => &cfg.telegram.member_allow_list,
        ("discord", ChatKind::Direct) => &cfg.discord.allow_list,
        ("discord", ChatKind::Group) => &cfg.discord.member_allow_list,
        _ => &[],
    };
    if !allow_list.is_empty() && !sender_matches(msg, allow_list) {
        return false;
    }

    // 2. DMs always pass once the allowlist did.
    if msg.chat_kind == ChatKind::Direct {
        return true;
    }

    // 3. Groups.
    let mentioned = cfg
        .group
        .mention_patterns
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .any(|re| re.is_match(&msg.body));

    if msg.channel == "telegram" {
        if let Some(group_id) = &msg.group_id {
            if let Some(over) = cfg.telegram.groups.get(group_id) {
                if !over.enabled {
                    return false;
                }
                if !over.allow_from.is_empty() && !sender_matches(msg, &over.allow_from) {
                    return false;
                }
                return !over.require_mention || mentioned;
            }
        }
    }

    if msg.channel == "discord"
        && cfg.discord.channel_allow_list.iter().any(|c| c == &msg.chat_id)
    {
        return true;
    }

    match cfg.group.activation {
        GroupActivation::Always => true,
        GroupActivation::Mention => mentioned,
    }
}

/// Match the sender by numeric id or `@username`.
fn sender_matches(msg: &InboundMessage, list: &[String]) -> bool {
    list.iter().any(|entry| {
        if let Some(username) = entry.strip_prefix('@') {
            msg.from_username.as_deref() == Some(username)
        } else {
            entry == &msg.from
        }
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
