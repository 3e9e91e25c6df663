// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Refreshable OAuth credentials for providers that support them.
//!
//! One YAML file per provider under `<state_dir>/auth/<provider>.yaml`,
//! written mode 0600.  Refresh-and-save is serialized per provider so two
//! concurrent requests cannot clobber a rotated refresh token.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::ProviderError;

/// Expiry slack: tokens within this window of expiring are refreshed eagerly.
const EXPIRY_SLACK_SECS: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthCredentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Token endpoint used for refresh.
    pub token_url: Option<String>,
    pub client_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuthCredentials {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => at <= now + Duration::seconds(EXPIRY_SLACK_SECS),
            None => false,
        }
    }
}

/// Disk-backed credential store with per-provider refresh serialization.
pub struct OAuthStore {
    dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
    client: reqwest::Client,
}

impl OAuthStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("auth"),
            locks: DashMap::new(),
            client: reqwest::Client::new(),
        }
    }

    fn path_for(&self, provider: &str) -> PathBuf {
        self.dir.join(format!("{provider}.yaml"))
    }

    pub fn load(&self, provider: &str) -> Option<OAuthCredentials> {
        let text = std::fs::read_to_string(self.path_for(provider)).ok()?;
        serde_yaml::from_str(&text).ok()
    }

    pub fn save(&self, provider: &str, creds: &OAuthCredentials) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating auth directory {}", self.dir.display()))?;
        let yaml = serde_yaml::to_string(creds).context("serializing credentials")?;
        write_secret_file(&self.path_for(provider), yaml.as_bytes())
    }

    pub fn remove(&self, provider: &str) -> anyhow::Result<()> {
        let path = self.path_for(provider);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("removing {}", path.display()))?;
        }
        Ok(())
    }

    /// Return a usable access token, refreshing and persisting when expired.
    ///
    /// `Ok(None)` means no credential file exists for this provider — the
    /// caller falls through to its "auth missing" error path.
    pub async fn access_token(&self, provider: &str) -> Result<Option<String>, ProviderError> {
        // Serialize refresh per provider to prevent lost refresh-token updates.
        let lock = self
            .locks
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let Some(creds) = self.load(provider) else {
            return Ok(None);
        };
        if !creds.is_expired(Utc::now()) {
            return Ok(Some(creds.access_token));
        }

        let refreshed = self.refresh(provider, &creds).await?;
        Ok(Some(refreshed.access_token))
    }

    async fn refresh(
        &self,
        provider: &str,
        creds: &OAuthCredentials,
    ) -> Result<OAuthCredentials, ProviderError> {
        let refresh_token = creds.refresh_token.as_deref().ok_or_else(|| {
            ProviderError::AuthMissing {
                provider: provider.to_string(),
            }
        })?;
        let token_url = creds.token_url.as_deref().ok_or_else(|| {
            ProviderError::AuthMissing {
                provider: provider.to_string(),
            }
        })?;

        debug!(provider, "refreshing OAuth access token");
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        if let Some(client_id) = &creds.client_id {
            form.push(("client_id", client_id.clone()));
        }

        let resp = self
            .client
            .post(token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| ProviderError::Api(format!("token refresh failed: {e}")))?;
        let status = resp.status().as_u16();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Api(format!("malformed token response: {e}")))?;
        if !(200..300).contains(&status) {
            return Err(ProviderError::AuthMissing {
                provider: provider.to_string(),
            });
        }

        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| ProviderError::Api("token response missing access_token".into()))?
            .to_string();
        let refreshed = OAuthCredentials {
            access_token,
            // Providers may rotate the refresh token; keep the old one otherwise.
            refresh_token: body["refresh_token"]
                .as_str()
                .map(str::to_string)
                .or_else(|| creds.refresh_token.clone()),
            token_url: creds.token_url.clone(),
            client_id: creds.client_id.clone(),
            expires_at: body["expires_in"]
                .as_i64()
                .map(|secs| Utc::now() + Duration::seconds(secs)),
        };

        self.save(provider, &refreshed)
            .map_err(|e| ProviderError::Api(format!("persisting refreshed credentials: {e}")))?;
        info!(provider, "OAuth credentials refreshed and saved");
        Ok(refreshed)
    }
}

/// Write `data` to `path` with mode 0o600 on Unix (owner-read/write only).
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
            .with_context(|| format!("writing secret file {}", path.display()))?;
        f.write_all(data)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, data)
            .with_context(|| format!("writing secret file {}", path.display()))?;
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
