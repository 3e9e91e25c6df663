// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end tests for the HTTP channel server (no network, tower oneshot).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use owliabot_config::Config;
use owliabot_gateway::http::{build_router, AppState};
use owliabot_gateway::{DeviceStore, InfraStore, Scope, ToolScope};
use owliabot_tools::{
    AuditLogger, CooldownTracker, ExecDeps, PolicyEngine, SecurityLevel, Tool, ToolCallLimiter,
    ToolContext, ToolRegistry, ToolResult, ToolSecurity,
};

const GATEWAY_TOKEN: &str = "test-gateway-token";

struct EchoTool {
    name: &'static str,
    level: SecurityLevel,
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        "echo for tests"
    }
    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }
    fn security(&self) -> ToolSecurity {
        ToolSecurity {
            level: self.level,
            confirm_required: false,
            max_value: None,
        }
    }
    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> ToolResult {
        ToolResult::ok(json!({ "echo": args }))
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    state: Arc<AppState>,
}

fn fixture() -> Fixture {
    fixture_with(|_| {})
}

fn fixture_with(tweak: impl FnOnce(&mut Config)) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.agent.state_dir = Some(dir.path().to_path_buf());
    config.gateway.enabled = true;
    tweak(&mut config);
    let config = Arc::new(config);

    let registry = Arc::new(ToolRegistry::new());
    registry
        .register(Arc::new(EchoTool {
            name: "lookup",
            level: SecurityLevel::Read,
        }))
        .unwrap();
    registry
        .register(Arc::new(EchoTool {
            name: "srv__a",
            level: SecurityLevel::Read,
        }))
        .unwrap();
    registry
        .register(Arc::new(EchoTool {
            name: "srv__b",
            level: SecurityLevel::Read,
        }))
        .unwrap();

    let tools_cfg = config.tools.clone();
    let state = Arc::new(AppState {
        config: config.clone(),
        devices: Arc::new(DeviceStore::open(dir.path()).unwrap()),
        infra: Arc::new(InfraStore::new()),
        exec: ExecDeps {
            registry,
            policy: Arc::new(PolicyEngine::from_config(&tools_cfg)),
            audit: Arc::new(AuditLogger::in_memory()),
            cooldowns: Arc::new(CooldownTracker::from_config(&tools_cfg)),
            rate_limiter: Arc::new(ToolCallLimiter::from_config(&tools_cfg)),
            write_gate: None,
            tool_timeout: Duration::from_secs(5),
            confirmation_enabled: tools_cfg.confirmation_enabled,
        },
        gateway_token_hash: AppState::token_hash_for(GATEWAY_TOKEN),
        started_at: Instant::now(),
        version: "test",
    });
    Fixture { _dir: dir, state }
}

impl Fixture {
    fn full_scope() -> Scope {
        Scope {
            tools: ToolScope {
                read_allowed: true,
                write_allowed: true,
                sign_allowed: true,
                allowlist: None,
                denylist: None,
            },
            system: true,
            mcp: true,
        }
    }

    /// Pair a device with the given scope; returns (device_id, token).
    fn paired_device(&self, scope: Scope) -> (String, String) {
        self.state.devices.enroll_pending("dev-1");
        let token = self.state.devices.approve("dev-1", scope).unwrap();
        ("dev-1".to_string(), token)
    }

    async fn request(&self, req: Request<Body>) -> (StatusCode, Vec<(String, String)>, Value) {
        let router = build_router(self.state.clone());
        let resp = router.oneshot(req).await.unwrap();
        let status = resp.status();
        let headers: Vec<(String, String)> = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, body)
    }

    async fn request_raw(&self, req: Request<Body>) -> (StatusCode, String) {
        let router = build_router(self.state.clone());
        let resp = router.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn json_post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// ── Health and admin auth ─────────────────────────────────────────────────────

#[tokio::test]
async fn health_needs_no_auth() {
    let f = fixture();
    let (status, _, body) = f
        .request(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["data"]["version"], "test");
}

#[tokio::test]
async fn status_requires_gateway_token() {
    let f = fixture();
    let (status, _, body) = f
        .request(Request::builder().uri("/status").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "ERR_UNAUTHORIZED");

    let (status, _, body) = f
        .request(
            Request::builder()
                .uri("/status")
                .header("x-gateway-token", GATEWAY_TOKEN)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["devices"].is_array());
}

// ── Pairing flow ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn pairing_lifecycle_end_to_end() {
    let f = fixture();

    // Unknown device requests pairing.
    let (status, _, body) = f
        .request(json_post("/pair/request", json!({ "device_id": "phone" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "pending");

    // Admin approves; token issued exactly once.
    let (status, _, body) = f
        .request({
            let mut req = json_post("/admin/approve", json!({ "device_id": "phone" }));
            req.headers_mut()
                .insert("x-gateway-token", GATEWAY_TOKEN.parse().unwrap());
            req
        })
        .await;
    assert_eq!(status, StatusCode::OK);
    let token = body["data"]["token"].as_str().unwrap().to_string();
    assert!(!token.is_empty());

    // Status reflects pairing.
    let (_, _, body) = f
        .request(
            Request::builder()
                .uri("/pair/status?device_id=phone")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(body["data"]["status"], "paired");

    // The paired device can poll events.
    let (status, _, _) = f
        .request(
            Request::builder()
                .uri("/events/poll")
                .header("x-device-id", "phone")
                .header("x-device-token", token)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn unpaired_device_gets_not_paired_error_and_is_enqueued() {
    let f = fixture();
    let (status, _, body) = f
        .request(
            Request::builder()
                .uri("/events/poll")
                .header("x-device-id", "stray")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "ERR_DEVICE_NOT_PAIRED");
    assert_eq!(f.state.devices.pending().len(), 1);
}

// ── /command/tool ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn command_tool_executes_with_scope() {
    let f = fixture();
    let (id, token) = f.paired_device(Fixture::full_scope());
    let mut req = json_post(
        "/command/tool",
        json!({ "calls": [{ "id": "c1", "name": "lookup", "arguments": {"q": 1} }] }),
    );
    req.headers_mut().insert("x-device-id", id.parse().unwrap());
    req.headers_mut().insert("x-device-token", token.parse().unwrap());
    let (status, _, body) = f.request(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["results"]["c1"]["success"], true);
}

#[tokio::test]
async fn command_tool_unknown_tool_is_403_and_never_executes() {
    let f = fixture();
    let (id, token) = f.paired_device(Fixture::full_scope());
    let mut req = json_post(
        "/command/tool",
        json!({ "calls": [{ "name": "does_not_exist" }] }),
    );
    req.headers_mut().insert("x-device-id", id.parse().unwrap());
    req.headers_mut().insert("x-device-token", token.parse().unwrap());
    let (status, _, body) = f.request(req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "ERR_UNKNOWN_TOOL");
    assert!(f.state.exec.audit.records().is_empty(), "nothing executed");
}

#[tokio::test]
async fn command_tool_scope_tier_is_enforced() {
    let f = fixture();
    // Read-only scope, registry has only read tools; deny via allowlist.
    let mut scope = Fixture::full_scope();
    scope.tools.allowlist = Some(vec!["srv__a".into()]);
    let (id, token) = f.paired_device(scope);
    let mut req = json_post("/command/tool", json!({ "calls": [{ "name": "lookup" }] }));
    req.headers_mut().insert("x-device-id", id.parse().unwrap());
    req.headers_mut().insert("x-device-token", token.parse().unwrap());
    let (status, _, body) = f.request(req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "ERR_FORBIDDEN");
}

#[tokio::test]
async fn command_tool_mcp_names_require_mcp_scope() {
    let f = fixture();
    let mut scope = Fixture::full_scope();
    scope.mcp = false;
    let (id, token) = f.paired_device(scope);
    let mut req = json_post("/command/tool", json!({ "calls": [{ "name": "srv__a" }] }));
    req.headers_mut().insert("x-device-id", id.parse().unwrap());
    req.headers_mut().insert("x-device-token", token.parse().unwrap());
    let (status, _, _) = f.request(req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn command_tool_idempotency_replay_is_byte_identical() {
    let f = fixture();
    let (id, token) = f.paired_device(Fixture::full_scope());
    let make = || {
        let mut req = json_post(
            "/command/tool",
            json!({ "calls": [{ "id": "c1", "name": "lookup", "arguments": {} }] }),
        );
        req.headers_mut().insert("x-device-id", id.parse().unwrap());
        req.headers_mut()
            .insert("x-device-token", token.parse().unwrap());
        req.headers_mut()
            .insert("idempotency-key", "idem-1".parse().unwrap());
        req
    };
    let (status1, body1) = f.request_raw(make()).await;
    let (status2, body2) = f.request_raw(make()).await;
    assert_eq!(status1, StatusCode::OK);
    assert_eq!(status2, StatusCode::OK);
    assert_eq!(body1, body2, "replay must be byte-identical");
    assert_eq!(f.state.exec.audit.records().len(), 1, "executed exactly once");
}

#[tokio::test]
async fn idempotency_key_with_different_body_is_rejected() {
    let f = fixture();
    let (id, token) = f.paired_device(Fixture::full_scope());
    let make = |name: &str| {
        let mut req = json_post("/command/tool", json!({ "calls": [{ "name": name }] }));
        req.headers_mut().insert("x-device-id", id.parse().unwrap());
        req.headers_mut()
            .insert("x-device-token", token.parse().unwrap());
        req.headers_mut()
            .insert("idempotency-key", "idem-2".parse().unwrap());
        req
    };
    let (status1, _) = f.request_raw(make("lookup")).await;
    assert_eq!(status1, StatusCode::OK);
    let (status2, _, body2) = f.request(make("srv__a")).await;
    assert_eq!(status2, StatusCode::BAD_REQUEST);
    assert_eq!(body2["error"]["code"], "ERR_INVALID_REQUEST");
}

// ── Rate limit ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn device_rate_limit_boundary() {
    let f = fixture_with(|c| {
        c.gateway.device_max_requests = 2;
    });
    let (id, token) = f.paired_device(Fixture::full_scope());
    let make = || {
        let mut req = json_post("/command/tool", json!({ "calls": [{ "name": "lookup" }] }));
        req.headers_mut().insert("x-device-id", id.parse().unwrap());
        req.headers_mut()
            .insert("x-device-token", token.parse().unwrap());
        req
    };
    // The max-th request succeeds; the (max+1)-th is rejected.
    assert_eq!(f.request(make()).await.0, StatusCode::OK);
    assert_eq!(f.request(make()).await.0, StatusCode::OK);
    let (status, _, body) = f.request(make()).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "ERR_RATE_LIMIT");
}

// ── Events ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn events_poll_with_ack_and_cursor() {
    let f = fixture();
    let (id, token) = f.paired_device(Fixture::full_scope());
    let e1 = f
        .state
        .infra
        .insert_event("t", "ok", "test", "one", json!({}), 60_000);
    let _e2 = f
        .state
        .infra
        .insert_event("t", "ok", "test", "two", json!({}), 60_000);

    let (status, _, body) = f
        .request(
            Request::builder()
                .uri(format!("/events/poll?ack={e1}"))
                .header("x-device-id", id.clone())
                .header("x-device-token", token.clone())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let events = body["data"]["events"].as_array().unwrap();
    assert_eq!(events.len(), 1, "acked event is not re-delivered");
    assert_eq!(events[0]["message"], "two");
    assert_eq!(body["data"]["cursor"], events[0]["id"]);
}

#[tokio::test]
async fn events_poll_reports_dropped_in_header() {
    let f = fixture_with(|c| {
        c.gateway.per_device_event_cap = 2;
    });
    let (id, token) = f.paired_device(Fixture::full_scope());
    for i in 0..5 {
        f.state
            .infra
            .insert_event("t", "ok", "test", &format!("e{i}"), json!({}), 60_000);
    }
    let (status, headers, body) = f
        .request(
            Request::builder()
                .uri("/events/poll")
                .header("x-device-id", id)
                .header("x-device-token", token)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["events"].as_array().unwrap().len(), 2);
    let dropped = headers
        .iter()
        .find(|(k, _)| k == "x-events-dropped")
        .map(|(_, v)| v.clone());
    assert_eq!(dropped.as_deref(), Some("3"));
}

// ── MCP ───────────────────────────────────────────────────────────────────────

fn mcp_request(id: &str, token: &str, body: Value) -> Request<Body> {
    let mut req = json_post("/mcp", body);
    req.headers_mut().insert("x-device-id", id.parse().unwrap());
    req.headers_mut()
        .insert("x-device-token", token.parse().unwrap());
    req
}

#[tokio::test]
async fn mcp_tools_list_returns_registered_tools() {
    // Two registered MCP tools must appear under a jsonrpc result.
    let f = fixture();
    let (id, token) = f.paired_device(Fixture::full_scope());
    let (status, _, body) = f
        .request(mcp_request(
            &id,
            &token,
            json!({ "jsonrpc": "2.0", "method": "tools/list", "id": 7 }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jsonrpc"], "2.0");
    assert_eq!(body["id"], 7);
    let names: Vec<&str> = body["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"srv__a"));
    assert!(names.contains(&"srv__b"));
}

#[tokio::test]
async fn mcp_requires_mcp_scope() {
    let f = fixture();
    let mut scope = Fixture::full_scope();
    scope.mcp = false;
    let (id, token) = f.paired_device(scope);
    let (status, _, body) = f
        .request(mcp_request(
            &id,
            &token,
            json!({ "jsonrpc": "2.0", "method": "tools/list", "id": 1 }),
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "ERR_FORBIDDEN");
}

#[tokio::test]
async fn mcp_parse_error_is_32700() {
    let f = fixture();
    let (id, token) = f.paired_device(Fixture::full_scope());
    let mut req = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    req.headers_mut().insert("x-device-id", id.parse().unwrap());
    req.headers_mut()
        .insert("x-device-token", token.parse().unwrap());
    let (_, _, body) = f.request(req).await;
    assert_eq!(body["error"]["code"], -32700);
}

#[tokio::test]
async fn mcp_unknown_method_is_32601() {
    let f = fixture();
    let (id, token) = f.paired_device(Fixture::full_scope());
    let (_, _, body) = f
        .request(mcp_request(
            &id,
            &token,
            json!({ "jsonrpc": "2.0", "method": "tools/destroy", "id": 2 }),
        ))
        .await;
    assert_eq!(body["error"]["code"], -32601);
    assert_eq!(body["id"], 2);
}

#[tokio::test]
async fn mcp_missing_jsonrpc_field_is_32600() {
    let f = fixture();
    let (id, token) = f.paired_device(Fixture::full_scope());
    let (_, _, body) = f
        .request(mcp_request(&id, &token, json!({ "method": "tools/list", "id": 3 })))
        .await;
    assert_eq!(body["error"]["code"], -32600);
}

#[tokio::test]
async fn mcp_tools_call_executes() {
    let f = fixture();
    let (id, token) = f.paired_device(Fixture::full_scope());
    let (_, _, body) = f
        .request(mcp_request(
            &id,
            &token,
            json!({
                "jsonrpc": "2.0",
                "method": "tools/call",
                "params": { "name": "srv__a", "arguments": { "x": 1 } },
                "id": 4,
            }),
        ))
        .await;
    assert_eq!(body["result"]["isError"], false);
    assert!(body["result"]["content"][0]["text"]
        .as_str()
        .unwrap()
        .contains("echo"));
}

#[tokio::test]
async fn mcp_servers_list_derives_prefixes() {
    let f = fixture();
    let (id, token) = f.paired_device(Fixture::full_scope());
    let (_, _, body) = f
        .request(mcp_request(
            &id,
            &token,
            json!({ "jsonrpc": "2.0", "method": "servers/list", "id": 5 }),
        ))
        .await;
    assert_eq!(body["result"]["servers"], json!(["srv"]));
}

// ── IP allowlist ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn ip_allowlist_blocks_requests_without_connect_info() {
    let f = fixture_with(|c| {
        c.gateway.ip_allowlist = vec!["10.0.0.0/8".into()];
    });
    let (status, _, body) = f
        .request(
            Request::builder()
                .uri("/pair/status?device_id=x")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "ERR_FORBIDDEN");
}
