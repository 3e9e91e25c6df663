// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! JSON-RPC 2.0 MCP surface: `tools/list`, `tools/call`, `servers/list`.
//!
//! Unlike the rest of the server this endpoint speaks strict JSON-RPC:
//! -32700 parse, -32600 invalid request, -32601 method not found,
//! -32602 invalid params, -32603 internal.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use owliabot_core::SessionKey;
use owliabot_model::ToolCall;
use owliabot_tools::{execute_tool_call, ToolContext};

use super::{auth::authenticate_device, ApiError, AppState};

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

fn rpc_error(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

fn rpc_result(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub async fn handle(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, ApiError> {
    super::check_ip(&state, addr.as_ref())?;
    let identity = authenticate_device(&headers, &state.devices)?;
    if !identity.scope.mcp {
        return Err(ApiError::forbidden("mcp scope required"));
    }

    let Ok(request) = serde_json::from_str::<Value>(&body) else {
        return Ok(Json(rpc_error(Value::Null, PARSE_ERROR, "parse error")).into_response());
    };
    let id = request.get("id").cloned().unwrap_or(Value::Null);

    if request.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Ok(Json(rpc_error(id, INVALID_REQUEST, "invalid request")).into_response());
    }
    let Some(method) = request.get("method").and_then(Value::as_str) else {
        return Ok(Json(rpc_error(id, INVALID_REQUEST, "invalid request")).into_response());
    };
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    let response = match method {
        "tools/list" => tools_list(&state, id),
        "tools/call" => tools_call(&state, &identity.id, &identity.scope, id, params).await,
        "servers/list" => servers_list(&state, id),
        _ => rpc_error(id, METHOD_NOT_FOUND, "method not found"),
    };
    Ok(Json(response).into_response())
}

fn tools_list(state: &AppState, id: Value) -> Value {
    let tools: Vec<Value> = state
        .exec
        .registry
        .schemas()
        .into_iter()
        .map(|s| {
            json!({
                "name": s.name,
                "description": s.description,
                "inputSchema": s.parameters,
            })
        })
        .collect();
    rpc_result(id, json!({ "tools": tools }))
}

/// Server names are the prefixes of `__`-infixed tool names.
fn servers_list(state: &AppState, id: Value) -> Value {
    let servers: BTreeSet<String> = state
        .exec
        .registry
        .list()
        .into_iter()
        .filter_map(|name| name.split_once("__").map(|(prefix, _)| prefix.to_string()))
        .collect();
    rpc_result(
        id,
        json!({ "servers": servers.into_iter().collect::<Vec<_>>() }),
    )
}

async fn tools_call(
    state: &AppState,
    device_id: &str,
    scope: &crate::Scope,
    id: Value,
    params: Value,
) -> Value {
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return rpc_error(id, INVALID_PARAMS, "params.name is required");
    };
    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

    let Some(tool) = state.exec.registry.get(name) else {
        return rpc_error(id, INVALID_PARAMS, &format!("unknown tool: {name}"));
    };
    if let Err(reason) = scope.check_tool(name, tool.security().level) {
        return rpc_error(id, INTERNAL_ERROR, &format!("scope denied: {reason}"));
    }

    let call = ToolCall {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        arguments,
    };
    let ctx = ToolContext {
        session_key: SessionKey::direct(&state.config.agent.id, "http")
            .as_str()
            .to_string(),
        agent_id: state.config.agent.id.clone(),
        channel: "http".into(),
        chat_id: device_id.to_string(),
        user_id: device_id.to_string(),
        workspace_path: state.config.agent.workspace.clone(),
        cancel: None,
        config: state.config.clone(),
    };
    let result = execute_tool_call(&call, &state.exec, &ctx).await;

    let text = if result.success {
        result
            .data
            .map(|d| match d {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .unwrap_or_default()
    } else {
        result.error.unwrap_or_else(|| "tool failed".into())
    };
    rpc_result(
        id,
        json!({
            "content": [{ "type": "text", "text": text }],
            "isError": !result.success,
        }),
    )
}
