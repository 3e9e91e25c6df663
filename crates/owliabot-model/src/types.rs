// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Opaque identifier minted by the provider (forwarded verbatim).
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments conforming to the tool's schema.
    pub arguments: serde_json::Value,
}

/// The outcome of one tool call, carried back to the model on a user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultRecord {
    pub tool_call_id: String,
    pub tool_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResultRecord {
    /// Plain-text rendering used for token estimation and truncation.
    pub fn text(&self) -> String {
        if self.success {
            match &self.data {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(v) => v.to_string(),
                None => String::new(),
            }
        } else {
            self.error.clone().unwrap_or_default()
        }
    }

    /// Replace the textual payload after truncation.
    pub fn set_text(&mut self, text: String) {
        if self.success {
            self.data = Some(serde_json::Value::String(text));
        } else {
            self.error = Some(text);
        }
    }
}

/// A single message in a conversation transcript.
///
/// Invariant: a user message carries either non-empty `content` or a
/// non-empty `tool_results` list, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Present on assistant messages that request tool invocations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Present on the synthetic user message carrying tool outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Vec<ToolResultRecord>>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
            timestamp: Utc::now(),
            tool_calls: None,
            tool_results: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
            timestamp: Utc::now(),
            tool_calls: None,
            tool_results: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            timestamp: Utc::now(),
            tool_calls: None,
            tool_results: None,
        }
    }

    /// Assistant message requesting one or more tool invocations.
    pub fn assistant_with_calls(text: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            timestamp: Utc::now(),
            tool_calls: if calls.is_empty() { None } else { Some(calls) },
            tool_results: None,
        }
    }

    /// Synthetic user message carrying tool outcomes back to the model.
    pub fn tool_results(results: Vec<ToolResultRecord>) -> Self {
        Self {
            role: Role::User,
            content: String::new(),
            timestamp: Utc::now(),
            tool_calls: None,
            tool_results: Some(results),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }

    pub fn has_tool_results(&self) -> bool {
        self.tool_results.as_ref().is_some_and(|r| !r.is_empty())
    }

    /// A "real" user message is one typed by a human, not a tool-result carrier.
    pub fn is_real_user_message(&self) -> bool {
        self.role == Role::User && !self.content.is_empty() && !self.has_tool_results()
    }

    /// Approximate token count: `⌈chars/4⌉` over all textual payload.
    pub fn approx_tokens(&self) -> usize {
        let mut chars = self.content.len();
        if let Some(calls) = &self.tool_calls {
            for c in calls {
                chars += c.name.len() + c.arguments.to_string().len();
            }
        }
        if let Some(results) = &self.tool_results {
            for r in results {
                chars += r.text().len();
            }
        }
        chars.div_ceil(4)
    }
}

// ─── Chat context (provider-agnostic request shape) ───────────────────────────

/// A tool schema handed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: serde_json::Value,
}

/// The provider-agnostic request shape consumed by drivers.
///
/// System messages are lifted out of the message list and concatenated into
/// `system_prompt`; the remaining messages keep their transcript order.
#[derive(Debug, Clone, Default)]
pub struct ChatContext {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
}

impl ChatContext {
    /// Split system messages off into the system prompt.
    pub fn from_messages(messages: Vec<Message>, tools: Vec<ToolSchema>) -> Self {
        let mut system_parts = Vec::new();
        let mut rest = Vec::with_capacity(messages.len());
        for m in messages {
            if m.role == Role::System {
                if !m.content.is_empty() {
                    system_parts.push(m.content);
                }
            } else {
                rest.push(m);
            }
        }
        Self {
            system_prompt: system_parts.join("\n\n"),
            messages: rest,
            tools,
        }
    }

    /// Reassemble the flat message list (system prompt first when non-empty).
    pub fn into_messages(self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if !self.system_prompt.is_empty() {
            out.push(Message::system(self.system_prompt));
        }
        out.extend(self.messages);
        out
    }
}

// ─── Responses ────────────────────────────────────────────────────────────────

/// Why the model stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Stop,
    ToolUse,
    Length,
}

/// Token usage from one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// One completed model turn.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
    pub usage: Option<Usage>,
    /// Provider id that actually served the request (failover-aware).
    pub provider: String,
    pub model: String,
    /// Set when the reply was cut off at the output token limit.
    pub truncated: bool,
}

impl LlmResponse {
    pub fn text(provider: impl Into<String>, model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
            stop_reason: StopReason::Stop,
            usage: None,
            provider: provider.into(),
            model: model.into(),
            truncated: false,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
