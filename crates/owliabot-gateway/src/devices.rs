// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Device pairing and token storage.
//!
//! Raw tokens are never persisted.  A device token or API key is shown to
//! the operator exactly once at approval time; only its SHA-256 digest is
//! stored.  All comparisons use [`subtle::ConstantTimeEq`] to prevent timing
//! oracles.  The index is a YAML snapshot written mode 0600.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::info;
use uuid::Uuid;

use owliabot_tools::SecurityLevel;

/// API keys are issued with this prefix so logs can redact them by shape.
pub const API_KEY_PREFIX: &str = "owk_";

// ─── Scope ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolScope {
    #[serde(default)]
    pub read_allowed: bool,
    #[serde(default)]
    pub write_allowed: bool,
    #[serde(default)]
    pub sign_allowed: bool,
    /// When set, only these tool names pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowlist: Option<Vec<String>>,
    /// Names here never pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denylist: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default)]
    pub tools: ToolScope,
    #[serde(default)]
    pub system: bool,
    #[serde(default)]
    pub mcp: bool,
}

impl Scope {
    /// Read-only scope handed to freshly approved devices by default.
    pub fn read_only() -> Self {
        Self {
            tools: ToolScope {
                read_allowed: true,
                ..ToolScope::default()
            },
            system: false,
            mcp: false,
        }
    }

    /// Check a tool against this scope.  Returns the denial reason on failure.
    ///
    /// Tier bits derive from the tool's security level; `__`-infixed names
    /// (MCP server tools) additionally require the `mcp` bit.
    pub fn check_tool(&self, name: &str, level: SecurityLevel) -> Result<(), &'static str> {
        let tier_ok = match level {
            SecurityLevel::Read => self.tools.read_allowed,
            SecurityLevel::Write => self.tools.write_allowed,
            SecurityLevel::Sign => self.tools.sign_allowed,
        };
        if !tier_ok {
            return Err("tier_not_allowed");
        }
        if let Some(allow) = &self.tools.allowlist {
            if !allow.iter().any(|n| n == name) {
                return Err("not_in_allowlist");
            }
        }
        if let Some(deny) = &self.tools.denylist {
            if deny.iter().any(|n| n == name) {
                return Err("in_denylist");
            }
        }
        if name.contains("__") && !self.mcp {
            return Err("mcp_scope_required");
        }
        Ok(())
    }
}

// ─── Devices ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Unknown,
    Pending,
    Paired,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    /// Hex SHA-256 of the device token.  Pending devices have none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_hash: Option<String>,
    #[serde(default)]
    pub scope: Scope,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Device {
    pub fn status(&self) -> DeviceStatus {
        if self.revoked_at.is_some() {
            DeviceStatus::Revoked
        } else if self.token_hash.is_some() {
            DeviceStatus::Paired
        } else {
            DeviceStatus::Pending
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiKeyEntry {
    pub id: String,
    pub label: String,
    pub key_hash: String,
    pub scope: Scope,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Listing shape (never includes hashes).
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeySummary {
    pub id: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DeviceIndex {
    #[serde(default)]
    devices: HashMap<String, Device>,
    #[serde(default)]
    api_keys: Vec<ApiKeyEntry>,
}

pub struct DeviceStore {
    path: PathBuf,
    inner: Mutex<DeviceIndex>,
}

impl DeviceStore {
    pub fn open(state_dir: &Path) -> anyhow::Result<Self> {
        let path = state_dir.join("devices.yaml");
        let index = if path.is_file() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str(&text).unwrap_or_default()
        } else {
            DeviceIndex::default()
        };
        Ok(Self {
            path,
            inner: Mutex::new(index),
        })
    }

    // ── Pairing lifecycle ─────────────────────────────────────────────────────

    /// Enqueue an unknown device as pending.  Idempotent per device id.
    pub fn enroll_pending(&self, device_id: &str) -> Device {
        let mut index = self.inner.lock().expect("device lock");
        let device = index
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| {
                info!(device_id, "enrolled pending device");
                Device {
                    device_id: device_id.to_string(),
                    token_hash: None,
                    scope: Scope::default(),
                    created_at: Utc::now(),
                    paired_at: None,
                    last_seen_at: None,
                    revoked_at: None,
                }
            })
            .clone();
        self.persist(&index);
        device
    }

    pub fn status(&self, device_id: &str) -> DeviceStatus {
        self.inner
            .lock()
            .expect("device lock")
            .devices
            .get(device_id)
            .map(|d| d.status())
            .unwrap_or(DeviceStatus::Unknown)
    }

    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.inner
            .lock()
            .expect("device lock")
            .devices
            .get(device_id)
            .cloned()
    }

    /// Approve a pending device: issue a token (returned once), store its
    /// hash, assign the scope.
    pub fn approve(&self, device_id: &str, scope: Scope) -> anyhow::Result<String> {
        let mut index = self.inner.lock().expect("device lock");
        let device = index
            .devices
            .get_mut(device_id)
            .ok_or_else(|| anyhow::anyhow!("unknown device: {device_id}"))?;
        if device.revoked_at.is_some() {
            anyhow::bail!("device is revoked: {device_id}");
        }
        let token = generate_token();
        device.token_hash = Some(sha256_hex(&token));
        device.scope = scope;
        device.paired_at = Some(Utc::now());
        info!(device_id, "device approved");
        self.persist(&index);
        Ok(token)
    }

    pub fn reject(&self, device_id: &str) -> bool {
        let mut index = self.inner.lock().expect("device lock");
        let removed = index
            .devices
            .get(device_id)
            .is_some_and(|d| d.status() == DeviceStatus::Pending)
            && index.devices.remove(device_id).is_some();
        if removed {
            self.persist(&index);
        }
        removed
    }

    pub fn revoke(&self, device_id: &str) -> bool {
        let mut index = self.inner.lock().expect("device lock");
        let Some(device) = index.devices.get_mut(device_id) else {
            return false;
        };
        device.revoked_at = Some(Utc::now());
        info!(device_id, "device revoked");
        self.persist(&index);
        true
    }

    pub fn set_scope(&self, device_id: &str, scope: Scope) -> bool {
        let mut index = self.inner.lock().expect("device lock");
        let Some(device) = index.devices.get_mut(device_id) else {
            return false;
        };
        device.scope = scope;
        self.persist(&index);
        true
    }

    /// Rotate the token of a paired device; returns the new raw token once.
    pub fn rotate_token(&self, device_id: &str) -> anyhow::Result<String> {
        let mut index = self.inner.lock().expect("device lock");
        let device = index
            .devices
            .get_mut(device_id)
            .ok_or_else(|| anyhow::anyhow!("unknown device: {device_id}"))?;
        if device.status() != DeviceStatus::Paired {
            anyhow::bail!("device is not paired: {device_id}");
        }
        let token = generate_token();
        device.token_hash = Some(sha256_hex(&token));
        self.persist(&index);
        Ok(token)
    }

    /// Verify a device token in constant time.  Touches `last_seen_at` on
    /// success.  Revoked devices never verify.
    pub fn verify_device(&self, device_id: &str, token: &str) -> Option<Device> {
        let mut index = self.inner.lock().expect("device lock");
        let device = index.devices.get_mut(device_id)?;
        if device.revoked_at.is_some() {
            return None;
        }
        let hash = device.token_hash.as_deref()?;
        if !ct_eq_hex(hash, &sha256_hex(token)) {
            return None;
        }
        device.last_seen_at = Some(Utc::now());
        let device = device.clone();
        self.persist(&index);
        Some(device)
    }

    pub fn list(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .inner
            .lock()
            .expect("device lock")
            .devices
            .values()
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    pub fn pending(&self) -> Vec<Device> {
        self.list()
            .into_iter()
            .filter(|d| d.status() == DeviceStatus::Pending)
            .collect()
    }

    // ── API keys ──────────────────────────────────────────────────────────────

    /// Create an API key; the raw `owk_…` value is returned exactly once.
    pub fn create_api_key(&self, label: &str, scope: Scope) -> (String, String) {
        let raw = format!("{API_KEY_PREFIX}{}", generate_token());
        let entry = ApiKeyEntry {
            id: Uuid::new_v4().to_string(),
            label: label.to_string(),
            key_hash: sha256_hex(&raw),
            scope,
            created_at: Utc::now(),
            revoked_at: None,
        };
        let mut index = self.inner.lock().expect("device lock");
        let id = entry.id.clone();
        index.api_keys.push(entry);
        self.persist(&index);
        (id, raw)
    }

    pub fn revoke_api_key(&self, id: &str) -> bool {
        let mut index = self.inner.lock().expect("device lock");
        let Some(entry) = index.api_keys.iter_mut().find(|k| k.id == id) else {
            return false;
        };
        entry.revoked_at = Some(Utc::now());
        self.persist(&index);
        true
    }

    pub fn list_api_keys(&self) -> Vec<ApiKeySummary> {
        self.inner
            .lock()
            .expect("device lock")
            .api_keys
            .iter()
            .map(|k| ApiKeySummary {
                id: k.id.clone(),
                label: k.label.clone(),
                created_at: k.created_at,
                revoked: k.revoked_at.is_some(),
            })
            .collect()
    }

    /// Resolve a raw `owk_…` key to its scope in constant time.
    pub fn verify_api_key(&self, raw: &str) -> Option<(String, Scope)> {
        if !raw.starts_with(API_KEY_PREFIX) {
            return None;
        }
        let hash = sha256_hex(raw);
        let index = self.inner.lock().expect("device lock");
        index
            .api_keys
            .iter()
            .find(|k| k.revoked_at.is_none() && ct_eq_hex(&k.key_hash, &hash))
            .map(|k| (k.id.clone(), k.scope.clone()))
    }

    fn persist(&self, index: &DeviceIndex) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_yaml::to_string(index) {
            Ok(yaml) => {
                if let Err(e) = write_secret_file(&self.path, yaml.as_bytes()) {
                    tracing::warn!(error = %e, "failed to persist device index");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize device index"),
        }
    }
}

// ─── Gateway admin token ──────────────────────────────────────────────────────

/// Resolved admin token: the stored hash plus, on first generation, the raw
/// value the operator must be shown exactly once.
pub struct GatewayToken {
    pub hash: String,
    pub fresh_raw: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GatewayTokenFile {
    token_hash: String,
}

/// Resolve the admin gateway token hash.
///
/// Order: explicit config value, then the stored hash file, then generate a
/// new token (returned raw once) and persist its hash mode 0600.
pub fn resolve_gateway_token(
    explicit: Option<&str>,
    state_dir: &Path,
) -> anyhow::Result<GatewayToken> {
    if let Some(token) = explicit {
        return Ok(GatewayToken {
            hash: sha256_hex(token),
            fresh_raw: None,
        });
    }
    let path = state_dir.join("gateway_token.yaml");
    if path.is_file() {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: GatewayTokenFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        return Ok(GatewayToken {
            hash: file.token_hash,
            fresh_raw: None,
        });
    }
    let raw = generate_token();
    let hash = sha256_hex(&raw);
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("creating {}", state_dir.display()))?;
    let yaml = serde_yaml::to_string(&GatewayTokenFile {
        token_hash: hash.clone(),
    })?;
    write_secret_file(&path, yaml.as_bytes())?;
    Ok(GatewayToken {
        hash,
        fresh_raw: Some(raw),
    })
}

// ─── Crypto helpers ───────────────────────────────────────────────────────────

/// 256-bit token from the OS CSPRNG, base64url (43 chars, no padding).
fn generate_token() -> String {
    use base64::Engine;
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

fn ct_eq_hex(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Write `data` to `path` with mode 0o600 on Unix.
fn write_secret_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("writing {}", path.display()))?;
        f.write_all(data)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, DeviceStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceStore::open(dir.path()).unwrap();
        (dir, store)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    #[test]
    fn unknown_then_pending_then_paired_then_revoked() {
        let (_d, store) = store();
        assert_eq!(store.status("dev1"), DeviceStatus::Unknown);
        store.enroll_pending("dev1");
        assert_eq!(store.status("dev1"), DeviceStatus::Pending);
        store.approve("dev1", Scope::read_only()).unwrap();
        assert_eq!(store.status("dev1"), DeviceStatus::Paired);
        store.revoke("dev1");
        assert_eq!(store.status("dev1"), DeviceStatus::Revoked);
    }

    #[test]
    fn enroll_is_idempotent() {
        let (_d, store) = store();
        store.enroll_pending("dev1");
        store.enroll_pending("dev1");
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn approved_token_verifies_and_touches_last_seen() {
        let (_d, store) = store();
        store.enroll_pending("dev1");
        let token = store.approve("dev1", Scope::read_only()).unwrap();
        let device = store.verify_device("dev1", &token).unwrap();
        assert!(device.last_seen_at.is_some());
        assert!(store.verify_device("dev1", "wrong-token").is_none());
    }

    #[test]
    fn revoked_device_never_verifies() {
        let (_d, store) = store();
        store.enroll_pending("dev1");
        let token = store.approve("dev1", Scope::read_only()).unwrap();
        store.revoke("dev1");
        assert!(store.verify_device("dev1", &token).is_none());
    }

    #[test]
    fn rotate_invalidates_old_token() {
        let (_d, store) = store();
        store.enroll_pending("dev1");
        let old = store.approve("dev1", Scope::read_only()).unwrap();
        let new = store.rotate_token("dev1").unwrap();
        assert!(store.verify_device("dev1", &old).is_none());
        assert!(store.verify_device("dev1", &new).is_some());
    }

    #[test]
    fn reject_removes_only_pending_devices() {
        let (_d, store) = store();
        store.enroll_pending("pending");
        store.enroll_pending("paired");
        store.approve("paired", Scope::read_only()).unwrap();
        assert!(store.reject("pending"));
        assert!(!store.reject("paired"));
        assert_eq!(store.status("pending"), DeviceStatus::Unknown);
    }

    #[test]
    fn store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let token = {
            let store = DeviceStore::open(dir.path()).unwrap();
            store.enroll_pending("dev1");
            store.approve("dev1", Scope::read_only()).unwrap()
        };
        let store = DeviceStore::open(dir.path()).unwrap();
        assert!(store.verify_device("dev1", &token).is_some());
    }

    // ── Scope checks ──────────────────────────────────────────────────────────

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

    #[test]
    fn scope_tier_bits_gate_levels() {
        let scope = Scope::read_only();
        assert!(scope.check_tool("lookup", SecurityLevel::Read).is_ok());
        assert_eq!(
            scope.check_tool("save", SecurityLevel::Write),
            Err("tier_not_allowed")
        );
        assert_eq!(
            scope.check_tool("sign", SecurityLevel::Sign),
            Err("tier_not_allowed")
        );
    }

    #[test]
    fn scope_allowlist_restricts_names() {
        let mut scope = full_scope();
        scope.tools.allowlist = Some(vec!["lookup".into()]);
        assert!(scope.check_tool("lookup", SecurityLevel::Read).is_ok());
        assert_eq!(
            scope.check_tool("other", SecurityLevel::Read),
            Err("not_in_allowlist")
        );
    }

    #[test]
    fn scope_denylist_blocks_names() {
        let mut scope = full_scope();
        scope.tools.denylist = Some(vec!["danger".into()]);
        assert_eq!(
            scope.check_tool("danger", SecurityLevel::Read),
            Err("in_denylist")
        );
    }

    #[test]
    fn mcp_tools_require_mcp_scope() {
        let mut scope = full_scope();
        scope.mcp = false;
        assert_eq!(
            scope.check_tool("srv__a", SecurityLevel::Read),
            Err("mcp_scope_required")
        );
        scope.mcp = true;
        assert!(scope.check_tool("srv__a", SecurityLevel::Read).is_ok());
    }

    // ── API keys ──────────────────────────────────────────────────────────────

    #[test]
    fn api_key_round_trip() {
        let (_d, store) = store();
        let (_id, raw) = store.create_api_key("laptop", full_scope());
        assert!(raw.starts_with(API_KEY_PREFIX));
        let (_, scope) = store.verify_api_key(&raw).unwrap();
        assert!(scope.mcp);
    }

    #[test]
    fn revoked_api_key_stops_verifying() {
        let (_d, store) = store();
        let (id, raw) = store.create_api_key("laptop", full_scope());
        assert!(store.revoke_api_key(&id));
        assert!(store.verify_api_key(&raw).is_none());
        assert!(store.list_api_keys()[0].revoked);
    }

    // ── Gateway token ─────────────────────────────────────────────────────────

    #[test]
    fn explicit_gateway_token_is_hashed_not_generated() {
        let dir = tempfile::tempdir().unwrap();
        let t = resolve_gateway_token(Some("secret"), dir.path()).unwrap();
        assert!(t.fresh_raw.is_none());
        assert_eq!(t.hash, sha256_hex("secret"));
    }

    #[test]
    fn generated_gateway_token_is_shown_once_then_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let first = resolve_gateway_token(None, dir.path()).unwrap();
        let raw = first.fresh_raw.expect("first run shows the raw token");
        assert_eq!(first.hash, sha256_hex(&raw));
        let second = resolve_gateway_token(None, dir.path()).unwrap();
        assert!(second.fresh_raw.is_none(), "raw token never shown again");
        assert_eq!(second.hash, first.hash);
    }

    #[test]
    fn api_key_without_prefix_is_rejected() {
        let (_d, store) = store();
        let (_id, raw) = store.create_api_key("laptop", full_scope());
        assert!(store.verify_api_key(raw.trim_start_matches(API_KEY_PREFIX)).is_none());
    }
}
