// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    ChatContext, CompleteOptions, LlmResponse, Message, ModelProvider, ProviderError, Role,
    StopReason, ToolCall, Usage,
};

/// Native Anthropic messages-API driver.
pub struct AnthropicProvider {
    id: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(id: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url
                .unwrap_or_else(|| "https://api.anthropic.com".into())
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, model: &str, ctx: &ChatContext, opts: &CompleteOptions) -> Value {
        let messages: Vec<Value> = ctx.messages.iter().map(to_wire_message).collect();

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": opts.max_tokens.unwrap_or(4096),
        });
        if let Some(t) = opts.temperature {
            body["temperature"] = json!(t);
        }
        if !ctx.system_prompt.is_empty() {
            body["system"] = json!(ctx.system_prompt);
        }
        if !ctx.tools.is_empty() {
            let tools: Vec<Value> = ctx
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        if let Some(effort) = &opts.reasoning {
            // Extended thinking: budget scales with the requested effort tier.
            let budget = match effort.as_str() {
                "high" => 16_384,
                "medium" => 8_192,
                _ => 2_048,
            };
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
        }
        body
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(
        &self,
        model: &str,
        ctx: &ChatContext,
        opts: &CompleteOptions,
    ) -> Result<LlmResponse, ProviderError> {
        let key = opts
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::AuthMissing {
                provider: self.id.clone(),
            })?;

        let body = self.build_body(model, ctx, opts);
        debug!(model, provider = %self.id, "sending anthropic request");

        let request = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send();

        let resp = match &opts.cancel {
            Some(cancel) => {
                let mut cancel = cancel.clone();
                tokio::select! {
                    _ = cancel.wait_for(|c| *c) => return Err(ProviderError::Cancelled),
                    r = request => r,
                }
            }
            None => request.await,
        }
        .map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::Api(format!("anthropic request failed: {e}"))
            }
        })?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| ProviderError::Api(format!("reading anthropic response: {e}")))?;
        if !(200..300).contains(&status) {
            return Err(ProviderError::from_status(status, text));
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Api(format!("malformed anthropic response: {e}")))?;
        parse_response(&self.id, model, &parsed)
    }
}

/// Map one transcript message into the Anthropic wire shape.
///
/// Tool results are emitted as distinct `tool_result` blocks, never merged
/// into user text.
fn to_wire_message(msg: &Message) -> Value {
    match msg.role {
        Role::Assistant => {
            let mut blocks: Vec<Value> = Vec::new();
            if !msg.content.is_empty() {
                blocks.push(json!({ "type": "text", "text": msg.content }));
            }
            if let Some(calls) = &msg.tool_calls {
                for c in calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": c.id,
                        "name": c.name,
                        "input": c.arguments,
                    }));
                }
            }
            json!({ "role": "assistant", "content": blocks })
        }
        _ => {
            if let Some(results) = &msg.tool_results {
                let blocks: Vec<Value> = results
                    .iter()
                    .map(|r| {
                        json!({
                            "type": "tool_result",
                            "tool_use_id": r.tool_call_id,
                            "content": r.text(),
                            "is_error": !r.success,
                        })
                    })
                    .collect();
                json!({ "role": "user", "content": blocks })
            } else {
                json!({ "role": "user", "content": [{ "type": "text", "text": msg.content }] })
            }
        }
    }
}

/// Parse a messages-API response body into an [`LlmResponse`].
fn parse_response(provider: &str, model: &str, v: &Value) -> Result<LlmResponse, ProviderError> {
    if let Some(err) = v.get("error") {
        let msg = err["message"].as_str().unwrap_or("unknown error").to_string();
        if crate::guard::is_context_overflow_message(&msg) {
            return Err(ProviderError::ContextOverflow(msg));
        }
        return Err(ProviderError::Api(msg));
    }

    let mut content = String::new();
    let mut tool_calls = Vec::new();
    if let Some(blocks) = v["content"].as_array() {
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => {
                    content.push_str(block["text"].as_str().unwrap_or_default());
                }
                Some("tool_use") => {
                    tool_calls.push(ToolCall {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        arguments: block["input"].clone(),
                    });
                }
                _ => {} // thinking blocks and unknown types are skipped
            }
        }
    }

    let (stop_reason, truncated) = match v["stop_reason"].as_str() {
        Some("tool_use") => (StopReason::ToolUse, false),
        Some("max_tokens") => {
            warn!(provider, model, "completion truncated at max_tokens");
            (StopReason::Length, true)
        }
        _ => (StopReason::Stop, false),
    };

    let usage = v.get("usage").map(|u| Usage {
        input_tokens: u["input_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: u["output_tokens"].as_u64().unwrap_or(0) as u32,
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
