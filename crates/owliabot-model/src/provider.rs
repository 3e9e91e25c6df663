// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

use crate::{ChatContext, LlmResponse, ProviderError};

/// Per-call options forwarded to a driver.
#[derive(Debug, Clone, Default)]
pub struct CompleteOptions {
    pub api_key: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Reasoning effort for providers that support it (passed through).
    pub reasoning: Option<String>,
    /// Cooperative cancellation; drivers must abandon work when it flips.
    pub cancel: Option<tokio::sync::watch::Receiver<bool>>,
}

impl CompleteOptions {
    /// True once the shared cancellation signal has fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

/// One LLM driver: given a model name and a chat context, produce a single
/// completed turn.  Streaming is an implementation detail of the driver;
/// the runner consumes whole turns.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Stable provider id for status display and failover logging.
    fn id(&self) -> &str;

    async fn complete(
        &self,
        model: &str,
        ctx: &ChatContext,
        opts: &CompleteOptions,
    ) -> Result<LlmResponse, ProviderError>;
}
