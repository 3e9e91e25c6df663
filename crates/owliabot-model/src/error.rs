// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Errors surfaced by provider drivers.
///
/// The runner keys its retry decisions off this taxonomy: `ContextOverflow`
/// is retried in-provider with a shrinking window, `Transient` and `Timeout`
/// advance to the next provider, everything else fails the provider and
/// advances failover as well.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The prompt exceeded the provider's context window.
    #[error("context overflow: {0}")]
    ContextOverflow(String),

    /// HTTP 429 or 5xx from the provider.
    #[error("transient provider error (status {status}): {message}")]
    Transient { status: u16, message: String },

    /// Request or sub-process deadline elapsed.
    #[error("provider request timed out")]
    Timeout,

    /// No API key configured and no refreshable OAuth credential on disk.
    #[error("no credentials for provider '{provider}'; run `owliabot auth setup {provider}`")]
    AuthMissing { provider: String },

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// Any other provider-reported failure.
    #[error("{0}")]
    Api(String),

    #[error("spawning CLI '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    /// Classify an HTTP status + body into the retry taxonomy.
    pub fn from_status(status: u16, body: String) -> Self {
        if crate::guard::is_context_overflow_message(&body) {
            return Self::ContextOverflow(body);
        }
        match status {
            429 | 500 | 502 | 503 | 504 => Self::Transient {
                status,
                message: body,
            },
            _ => Self::Api(format!("HTTP {status}: {body}")),
        }
    }

    /// True for errors that should advance failover without in-provider retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout)
    }

    pub fn is_context_overflow(&self) -> bool {
        matches!(self, Self::ContextOverflow(_))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
