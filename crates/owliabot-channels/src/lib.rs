// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod channel;
mod router;

#[cfg(feature = "discord")]
pub mod discord;
#[cfg(feature = "telegram")]
pub mod telegram;

pub use channel::{Channel, ChatKind, InboundMessage};
pub use router::{ReplyRouter, WaiterGuard};
