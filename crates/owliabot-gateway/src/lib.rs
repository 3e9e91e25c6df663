// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod activation;
mod commands;
mod devices;
mod gate;
mod infra;
mod pipeline;

pub mod http;

pub use activation::should_handle_message;
pub use commands::{try_handle_command, CommandDeps};
pub use devices::{
    resolve_gateway_token, ApiKeySummary, Device, DeviceStatus, DeviceStore, GatewayToken, Scope,
    ToolScope,
};
pub use gate::ChannelWriteGate;
pub use infra::{Event, IdempotencyRecord, InfraStore, PollResult, RateLimitDecision};
pub use pipeline::{DefaultPromptBuilder, Gateway, GatewayDeps, PromptBuilder};
