// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! HTTP channel server: pairing, scoped commands, event polling, MCP.
//!
//! All non-MCP responses use the `{ok, data?, error?}` envelope.  Admin
//! routes take the static gateway token; agentic routes take device auth.
//! Non-public routes additionally honor the configured IP allowlist.

mod auth;
mod mcp;

pub use auth::{authenticate_device, ip_allowed, normalize_remote_addr, DeviceIdentity};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::info;

use owliabot_core::SessionKey;
use owliabot_model::ToolCall;
use owliabot_tools::{execute_tool_calls, ExecDeps, ToolContext};

use crate::{DeviceStore, InfraStore, Scope};

/// Shared state for all HTTP handlers.
pub struct AppState {
    pub config: Arc<owliabot_config::Config>,
    pub devices: Arc<DeviceStore>,
    pub infra: Arc<InfraStore>,
    pub exec: ExecDeps,
    /// Hex SHA-256 of the admin gateway token.
    pub gateway_token_hash: String,
    pub started_at: Instant,
    pub version: &'static str,
}

impl AppState {
    pub fn token_hash_for(token: &str) -> String {
        hex::encode(Sha256::digest(token.as_bytes()))
    }
}

// ─── Envelope ─────────────────────────────────────────────────────────────────

/// Error half of the response envelope.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "ERR_UNAUTHORIZED", "unauthorized")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "ERR_FORBIDDEN", message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "ERR_INVALID_REQUEST", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "ERR_NOT_FOUND", message)
    }

    pub fn rate_limited() -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "ERR_RATE_LIMIT", "rate limit exceeded")
    }

    pub fn device_not_paired() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "ERR_DEVICE_NOT_PAIRED",
            "device is not paired; awaiting approval",
        )
    }

    pub fn unknown_tool(name: &str) -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            "ERR_UNKNOWN_TOOL",
            format!("unknown tool: {name}"),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "ok": false,
            "error": { "code": self.code, "message": self.message },
        });
        (self.status, Json(body)).into_response()
    }
}

fn ok(data: Value) -> Response {
    Json(json!({ "ok": true, "data": data })).into_response()
}

// ─── Router ───────────────────────────────────────────────────────────────────

pub fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.gateway.body_limit_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/pair/request", post(pair_request))
        .route("/pair/status", get(pair_status))
        .route("/admin/approve", post(admin_approve))
        .route("/admin/reject", post(admin_reject))
        .route("/admin/revoke", post(admin_revoke))
        .route("/admin/scope", post(admin_scope))
        .route("/admin/rotate-token", post(admin_rotate_token))
        .route("/admin/api-keys", post(admin_create_api_key).get(admin_list_api_keys))
        .route("/admin/api-keys/:id", delete(admin_revoke_api_key))
        .route("/events/poll", get(events_poll))
        .route("/command/tool", post(command_tool))
        .route("/command/system", post(command_system))
        .route("/mcp", post(mcp::handle))
        .layer(tower_http::limit::RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        state.config.gateway.host, state.config.gateway.port
    )
    .parse()?;
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP channel server listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

// ─── Guards ───────────────────────────────────────────────────────────────────

fn check_ip(state: &AppState, addr: Option<&ConnectInfo<SocketAddr>>) -> Result<(), ApiError> {
    let allowlist = &state.config.gateway.ip_allowlist;
    if allowlist.is_empty() {
        return Ok(());
    }
    let Some(ConnectInfo(addr)) = addr else {
        return Err(ApiError::forbidden("remote address unavailable"));
    };
    let normalized = normalize_remote_addr(&addr.ip().to_string());
    let Ok(ip) = normalized.parse() else {
        return Err(ApiError::forbidden("unparseable remote address"));
    };
    if ip_allowed(ip, allowlist) {
        Ok(())
    } else {
        Err(ApiError::forbidden("remote address not allowed"))
    }
}

fn device_rate_limit(state: &AppState, device_id: &str) -> Result<(), ApiError> {
    let decision = state.infra.check_rate_limit(
        &format!("device:{device_id}"),
        state.config.gateway.device_window_ms,
        state.config.gateway.device_max_requests,
        Utc::now(),
    );
    if decision.allowed {
        Ok(())
    } else {
        Err(ApiError::rate_limited())
    }
}

// ─── Public routes ────────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Response {
    ok(json!({
        "ok": true,
        "version": state.version,
        "uptime": state.started_at.elapsed().as_secs(),
    }))
}

// ─── Admin routes ─────────────────────────────────────────────────────────────

fn device_summary(d: &crate::Device) -> Value {
    json!({
        "device_id": d.device_id,
        "status": d.status(),
        "paired_at": d.paired_at,
        "last_seen_at": d.last_seen_at,
    })
}

async fn status(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    check_ip(&state, addr.as_ref())?;
    auth::require_gateway_token(&headers, &state.gateway_token_hash)?;
    let devices: Vec<Value> = state.devices.list().iter().map(device_summary).collect();
    let pending: Vec<Value> = state.devices.pending().iter().map(device_summary).collect();
    Ok(ok(json!({ "devices": devices, "pending": pending })))
}

#[derive(Deserialize)]
struct DeviceIdBody {
    device_id: String,
}

#[derive(Deserialize)]
struct ApproveBody {
    device_id: String,
    #[serde(default)]
    scope: Option<Scope>,
}

async fn admin_approve(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(body): Json<ApproveBody>,
) -> Result<Response, ApiError> {
    check_ip(&state, addr.as_ref())?;
    auth::require_gateway_token(&headers, &state.gateway_token_hash)?;
    let scope = body.scope.unwrap_or_else(Scope::read_only);
    let token = state
        .devices
        .approve(&body.device_id, scope.clone())
        .map_err(|e| ApiError::not_found(e.to_string()))?;
    Ok(ok(json!({
        "device_id": body.device_id,
        "token": token,
        "scope": scope,
    })))
}

async fn admin_reject(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(body): Json<DeviceIdBody>,
) -> Result<Response, ApiError> {
    check_ip(&state, addr.as_ref())?;
    auth::require_gateway_token(&headers, &state.gateway_token_hash)?;
    if state.devices.reject(&body.device_id) {
        Ok(ok(json!({ "device_id": body.device_id })))
    } else {
        Err(ApiError::not_found("no pending device with that id"))
    }
}

async fn admin_revoke(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(body): Json<DeviceIdBody>,
) -> Result<Response, ApiError> {
    check_ip(&state, addr.as_ref())?;
    auth::require_gateway_token(&headers, &state.gateway_token_hash)?;
    if state.devices.revoke(&body.device_id) {
        Ok(ok(json!({ "device_id": body.device_id })))
    } else {
        Err(ApiError::not_found("unknown device"))
    }
}

#[derive(Deserialize)]
struct ScopeBody {
    device_id: String,
    scope: Scope,
}

async fn admin_scope(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(body): Json<ScopeBody>,
) -> Result<Response, ApiError> {
    check_ip(&state, addr.as_ref())?;
    auth::require_gateway_token(&headers, &state.gateway_token_hash)?;
    if state.devices.set_scope(&body.device_id, body.scope) {
        Ok(ok(json!({ "device_id": body.device_id })))
    } else {
        Err(ApiError::not_found("unknown device"))
    }
}

async fn admin_rotate_token(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(body): Json<DeviceIdBody>,
) -> Result<Response, ApiError> {
    check_ip(&state, addr.as_ref())?;
    auth::require_gateway_token(&headers, &state.gateway_token_hash)?;
    let token = state
        .devices
        .rotate_token(&body.device_id)
        .map_err(|e| ApiError::not_found(e.to_string()))?;
    Ok(ok(json!({ "device_id": body.device_id, "token": token })))
}

#[derive(Deserialize)]
struct CreateApiKeyBody {
    label: String,
    #[serde(default)]
    scope: Option<Scope>,
}

async fn admin_create_api_key(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(body): Json<CreateApiKeyBody>,
) -> Result<Response, ApiError> {
    check_ip(&state, addr.as_ref())?;
    auth::require_gateway_token(&headers, &state.gateway_token_hash)?;
    let scope = body.scope.unwrap_or_else(Scope::read_only);
    let (id, key) = state.devices.create_api_key(&body.label, scope);
    Ok(ok(json!({ "id": id, "key": key })))
}

async fn admin_list_api_keys(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    check_ip(&state, addr.as_ref())?;
    auth::require_gateway_token(&headers, &state.gateway_token_hash)?;
    Ok(ok(json!({ "keys": state.devices.list_api_keys() })))
}

async fn admin_revoke_api_key(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    check_ip(&state, addr.as_ref())?;
    auth::require_gateway_token(&headers, &state.gateway_token_hash)?;
    if state.devices.revoke_api_key(&id) {
        Ok(ok(json!({ "id": id })))
    } else {
        Err(ApiError::not_found("unknown api key"))
    }
}

// ─── Pairing ──────────────────────────────────────────────────────────────────

async fn pair_request(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    Json(body): Json<DeviceIdBody>,
) -> Result<Response, ApiError> {
    check_ip(&state, addr.as_ref())?;
    if body.device_id.is_empty() {
        return Err(ApiError::invalid("device_id must be non-empty"));
    }
    let device = state.devices.enroll_pending(&body.device_id);
    Ok(ok(json!({ "device_id": device.device_id, "status": device.status() })))
}

#[derive(Deserialize)]
struct PairStatusQuery {
    device_id: String,
}

async fn pair_status(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    Query(q): Query<PairStatusQuery>,
) -> Result<Response, ApiError> {
    check_ip(&state, addr.as_ref())?;
    Ok(ok(json!({ "status": state.devices.status(&q.device_id) })))
}

// ─── Events ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PollQuery {
    since: Option<u64>,
    ack: Option<u64>,
}

async fn events_poll(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Query(q): Query<PollQuery>,
) -> Result<Response, ApiError> {
    check_ip(&state, addr.as_ref())?;
    let identity = authenticate_device(&headers, &state.devices)?;
    device_rate_limit(&state, &identity.id)?;
    let now = Utc::now();
    state.infra.cleanup(now);

    if let Some(ack) = q.ack {
        state.infra.ack_events(&identity.id, ack, now);
    }
    let result = state.infra.poll_events_for_device(
        &identity.id,
        q.since,
        state.config.gateway.poll_batch_size,
        state.config.gateway.per_device_event_cap,
        now,
    );
    let mut response = ok(json!({
        "cursor": result.cursor,
        "events": result.events,
    }));
    if result.dropped > 0 {
        response.headers_mut().insert(
            "x-events-dropped",
            result.dropped.to_string().parse().expect("numeric header"),
        );
    }
    Ok(response)
}

// ─── Commands ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Deserialize)]
struct CommandToolBody {
    calls: Vec<WireToolCall>,
}

/// Idempotency hash binds the replayed response to the exact request.
fn idempotency_hash(method: &str, path: &str, body: &str, device_id: &str) -> String {
    hex::encode(Sha256::digest(
        format!("{method}|{path}|{body}|{device_id}").as_bytes(),
    ))
}

fn replay_response(stored: String) -> Response {
    (
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        stored,
    )
        .into_response()
}

async fn command_tool(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, ApiError> {
    check_ip(&state, addr.as_ref())?;
    let identity = authenticate_device(&headers, &state.devices)?;
    device_rate_limit(&state, &identity.id)?;
    let now = Utc::now();
    state.infra.cleanup(now);

    // Idempotency replay before any execution.
    let idem_header = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let request_hash = idempotency_hash("POST", "/command/tool", &body, &identity.id);
    if let Some(key) = &idem_header {
        let stored_key = format!("http:{key}");
        if let Some(record) = state.infra.get_idempotency(&stored_key, now) {
            if record.request_hash == request_hash {
                return Ok(replay_response(record.response));
            }
            return Err(ApiError::invalid(
                "Idempotency-Key reused with a different request",
            ));
        }
    }

    let parsed: CommandToolBody =
        serde_json::from_str(&body).map_err(|e| ApiError::invalid(format!("bad body: {e}")))?;
    if parsed.calls.is_empty() {
        return Err(ApiError::invalid("calls must be non-empty"));
    }

    // Scope gate: every call must pass before anything executes.
    for call in &parsed.calls {
        let Some(tool) = state.exec.registry.get(&call.name) else {
            return Err(ApiError::unknown_tool(&call.name));
        };
        identity
            .scope
            .check_tool(&call.name, tool.security().level)
            .map_err(|reason| ApiError::forbidden(format!("{}: {reason}", call.name)))?;
    }

    let calls: Vec<ToolCall> = parsed
        .calls
        .into_iter()
        .map(|c| ToolCall {
            id: c.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: c.name,
            arguments: c.arguments,
        })
        .collect();

    let ctx = ToolContext {
        session_key: SessionKey::direct(&state.config.agent.id, "http")
            .as_str()
            .to_string(),
        agent_id: state.config.agent.id.clone(),
        channel: "http".into(),
        chat_id: identity.id.clone(),
        user_id: identity.id.clone(),
        workspace_path: state.config.agent.workspace.clone(),
        cancel: None,
        config: state.config.clone(),
    };
    let results = execute_tool_calls(&calls, &state.exec, &ctx).await;

    let results_json: serde_json::Map<String, Value> = calls
        .iter()
        .map(|c| {
            let r = results.get(&c.id);
            (c.id.clone(), serde_json::to_value(r).unwrap_or(Value::Null))
        })
        .collect();
    let response_body =
        json!({ "ok": true, "data": { "results": Value::Object(results_json) } }).to_string();

    if let Some(key) = idem_header {
        let ttl = ChronoDuration::milliseconds(state.config.gateway.idempotency_ttl_ms as i64);
        let _ = state.infra.save_idempotency(
            &format!("http:{key}"),
            &request_hash,
            &response_body,
            now + ttl,
        );
    }
    Ok(replay_response(response_body))
}

#[derive(Deserialize)]
struct SystemBody {
    action: String,
}

async fn command_system(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, ApiError> {
    check_ip(&state, addr.as_ref())?;
    let identity = authenticate_device(&headers, &state.devices)?;
    if !identity.scope.system {
        return Err(ApiError::forbidden("system scope required"));
    }
    device_rate_limit(&state, &identity.id)?;
    let now = Utc::now();

    let idem_header = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let request_hash = idempotency_hash("POST", "/command/system", &body, &identity.id);
    if let Some(key) = &idem_header {
        if let Some(record) = state.infra.get_idempotency(&format!("http:{key}"), now) {
            if record.request_hash == request_hash {
                return Ok(replay_response(record.response));
            }
            return Err(ApiError::invalid(
                "Idempotency-Key reused with a different request",
            ));
        }
    }

    let parsed: SystemBody =
        serde_json::from_str(&body).map_err(|e| ApiError::invalid(format!("bad body: {e}")))?;
    let data = match parsed.action.as_str() {
        "ping" => json!({ "pong": true }),
        "status" => json!({
            "version": state.version,
            "uptime": state.started_at.elapsed().as_secs(),
            "devices": state.devices.list().len(),
            "tools": state.exec.registry.list(),
        }),
        other => return Err(ApiError::invalid(format!("unknown system action: {other}"))),
    };
    let response_body = json!({ "ok": true, "data": data }).to_string();
    if let Some(key) = idem_header {
        let ttl = ChronoDuration::milliseconds(state.config.gateway.idempotency_ttl_ms as i64);
        let _ = state.infra.save_idempotency(
            &format!("http:{key}"),
            &request_hash,
            &response_body,
            now + ttl,
        );
    }
    Ok(replay_response(response_body))
}
