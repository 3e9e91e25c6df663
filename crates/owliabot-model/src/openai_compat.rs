// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Driver for every endpoint speaking the `/chat/completions` wire format.
//!
//! OpenAI itself, OpenRouter, and most self-hosted servers (vLLM, Ollama,
//! LM Studio) share this shape, so a single driver configured with a base
//! URL covers them all.  Authentication is a bearer header when a key is
//! present; local servers typically run without one.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    ChatContext, CompleteOptions, LlmResponse, Message, ModelProvider, ProviderError, Role,
    StopReason, ToolCall, Usage,
};

pub struct OpenAiCompatProvider {
    id: String,
    chat_url: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(id: impl Into<String>, base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            id: id.into(),
            chat_url: format!("{base}/chat/completions"),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(
        &self,
        model: &str,
        ctx: &ChatContext,
        opts: &CompleteOptions,
    ) -> Result<LlmResponse, ProviderError> {
        let mut messages: Vec<Value> = Vec::with_capacity(ctx.messages.len() + 1);
        if !ctx.system_prompt.is_empty() {
            messages.push(json!({ "role": "system", "content": ctx.system_prompt }));
        }
        for m in &ctx.messages {
            append_wire_messages(&mut messages, m);
        }

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": opts.max_tokens.unwrap_or(4096),
        });
        if let Some(t) = opts.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(effort) = &opts.reasoning {
            body["reasoning_effort"] = json!(effort);
        }
        if !ctx.tools.is_empty() {
            let tools: Vec<Value> = ctx
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }

        debug!(model, provider = %self.id, url = %self.chat_url, "sending chat completion");
        let mut req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = &opts.api_key {
            req = req.bearer_auth(key);
        }

        let send = req.send();
        let resp = match &opts.cancel {
            Some(cancel) => {
                let mut cancel = cancel.clone();
                tokio::select! {
                    _ = cancel.wait_for(|c| *c) => return Err(ProviderError::Cancelled),
                    r = send => r,
                }
            }
            None => send.await,
        }
        .map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::Api(format!("request to {} failed: {e}", self.id))
            }
        })?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| ProviderError::Api(format!("reading response: {e}")))?;
        if !(200..300).contains(&status) {
            return Err(ProviderError::from_status(status, text));
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Api(format!("malformed response body: {e}")))?;
        parse_first_choice(&self.id, model, &parsed)
    }
}

/// Append the wire message(s) for one transcript message.
///
/// A tool-result user message expands into one `role: tool` record per
/// result, which is how the compatible format represents parallel results.
fn append_wire_messages(out: &mut Vec<Value>, msg: &Message) {
    match msg.role {
        Role::System => out.push(json!({ "role": "system", "content": msg.content })),
        Role::Assistant => {
            let mut m = json!({ "role": "assistant", "content": msg.content });
            if let Some(calls) = &msg.tool_calls {
                let wire: Vec<Value> = calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": {
                                "name": c.name,
                                "arguments": c.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                m["tool_calls"] = json!(wire);
            }
            out.push(m);
        }
        Role::User => {
            if let Some(results) = &msg.tool_results {
                for r in results {
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": r.tool_call_id,
                        "content": r.text(),
                    }));
                }
            } else {
                out.push(json!({ "role": "user", "content": msg.content }));
            }
        }
    }
}

/// Parse the first choice of a chat-completion response.
fn parse_first_choice(provider: &str, model: &str, v: &Value) -> Result<LlmResponse, ProviderError> {
    if let Some(err) = v.get("error") {
        let msg = err["message"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        if crate::guard::is_context_overflow_message(&msg) {
            return Err(ProviderError::ContextOverflow(msg));
        }
        return Err(ProviderError::Api(msg));
    }

    let choice = v["choices"]
        .as_array()
        .and_then(|c| c.first())
        .ok_or_else(|| ProviderError::Api("response contains no choices".into()))?;
    let message = &choice["message"];

    let content = message["content"].as_str().unwrap_or_default().to_string();
    let mut tool_calls = Vec::new();
    if let Some(calls) = message["tool_calls"].as_array() {
        for c in calls {
            let args_raw = c["function"]["arguments"].as_str().unwrap_or("{}");
            let arguments = serde_json::from_str(args_raw).unwrap_or(Value::Null);
            tool_calls.push(ToolCall {
                id: c["id"].as_str().unwrap_or_default().to_string(),
                name: c["function"]["name"].as_str().unwrap_or_default().to_string(),
                arguments,
            });
        }
    }

    let (stop_reason, truncated) = match choice["finish_reason"].as_str() {
        Some("tool_calls") => (StopReason::ToolUse, false),
        Some("length") => {
            warn!(provider, model, "completion truncated at length limit");
            (StopReason::Length, true)
        }
        _ => (StopReason::Stop, false),
    };

    let usage = v.get("usage").map(|u| Usage {
        input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
    });

    Ok(LlmResponse {
        content,
        tool_calls,
        stop_reason,
        usage,
        provider: provider.to_string(),
        model: model.to_string(),
        truncated,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
