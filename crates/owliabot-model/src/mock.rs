// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Mock drivers for tests: no network, deterministic output.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use crate::{
    ChatContext, CompleteOptions, LlmResponse, ModelProvider, ProviderError, StopReason,
};

/// Echoes the last user message back as the assistant reply.
pub struct MockProvider {
    id: String,
}

impl MockProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(
        &self,
        model: &str,
        ctx: &ChatContext,
        _opts: &CompleteOptions,
    ) -> Result<LlmResponse, ProviderError> {
        let last_user = ctx
            .messages
            .iter()
            .rev()
            .find(|m| m.is_real_user_message())
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(LlmResponse::text(&self.id, model, format!("echo: {last_user}")))
    }
}

/// Returns a scripted sequence of responses/errors, one per call.
///
/// Calls past the end of the script return an error so runaway loops fail
/// loudly in tests.
pub struct ScriptedMockProvider {
    id: String,
    script: Mutex<VecDeque<Result<LlmResponse, ProviderError>>>,
    calls: AtomicUsize,
}

impl ScriptedMockProvider {
    pub fn new(
        id: impl Into<String>,
        script: Vec<Result<LlmResponse, ProviderError>>,
    ) -> Self {
        Self {
            id: id.into(),
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `complete` calls observed so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Convenience: a single plain-text reply.
    pub fn reply(id: impl Into<String>, text: impl Into<String>) -> Self {
        let id = id.into();
        let resp = LlmResponse::text(&id, "mock-model", text);
        Self::new(id, vec![Ok(resp)])
    }
}

#[async_trait]
impl ModelProvider for ScriptedMockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(
        &self,
        _model: &str,
        _ctx: &ChatContext,
        opts: &CompleteOptions,
    ) -> Result<LlmResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if opts.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Api("mock script exhausted".into())))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
