// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod guard;
pub mod registry;
mod anthropic;
mod cli_runner;
mod error;
mod mock;
mod oauth;
mod openai_compat;
mod provider;
mod runner;
mod types;

pub use anthropic::AnthropicProvider;
pub use cli_runner::{CliRunArgs, CliRunOutcome, CliRunner};
pub use error::ProviderError;
pub use mock::{MockProvider, ScriptedMockProvider};
pub use oauth::{OAuthCredentials, OAuthStore};
pub use openai_compat::OpenAiCompatProvider;
pub use provider::{CompleteOptions, ModelProvider};
pub use registry::{driver_kind, api_key_env_for, DriverKind};
pub use runner::{ProviderRunner, RunOptions};
pub use types::*;
