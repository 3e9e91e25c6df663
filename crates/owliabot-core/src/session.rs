// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// Conversation kind within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    #[default]
    Direct,
    Group,
}

/// Deterministic session key: `agent:<agentId>:<channel>:conv:<conversationId>`
/// where the conversation id is `main:main` for DMs and `group:<groupId>` for
/// groups.  One key maps to one active logical session at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn direct(agent_id: &str, channel: &str) -> Self {
        Self(format!("agent:{agent_id}:{channel}:conv:main:main"))
    }

    pub fn group(agent_id: &str, channel: &str, group_id: &str) -> Self {
        Self(format!("agent:{agent_id}:{channel}:conv:group:{group_id}"))
    }

    pub fn for_chat(agent_id: &str, channel: &str, chat_type: ChatType, group_id: Option<&str>) -> Self {
        match (chat_type, group_id) {
            (ChatType::Group, Some(g)) => Self::group(agent_id, channel, g),
            _ => Self::direct(agent_id, channel),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata supplied when a session is first created.
#[derive(Debug, Clone, Default)]
pub struct SessionMeta {
    pub channel: String,
    pub chat_type: ChatType,
    pub group_id: Option<String>,
    pub display_name: Option<String>,
}

/// Per-key session entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub key: String,
    pub channel: String,
    pub chat_type: ChatType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub message_count: u64,
    /// Preferred provider id recorded on the session (set via commands).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_model_override: Option<String>,
}

impl Session {
    fn fresh(key: &SessionKey, meta: &SessionMeta) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            key: key.as_str().to_string(),
            channel: meta.channel.clone(),
            chat_type: meta.chat_type,
            group_id: meta.group_id.clone(),
            display_name: meta.display_name.clone(),
            created_at: now,
            last_active_at: now,
            message_count: 0,
            primary_model_override: None,
        }
    }
}

/// Session index persisted as a YAML snapshot.
///
/// All mutation goes through one mutex so `rotate` is serialized against
/// concurrent `get_or_create`: once `rotate` returns, every later
/// `get_or_create` observes the new session id.
pub struct SessionStore {
    path: PathBuf,
    inner: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    /// Open (or create) the store at `<state_dir>/sessions.yaml`.
    pub fn open(state_dir: &std::path::Path) -> anyhow::Result<Self> {
        let path = state_dir.join("sessions.yaml");
        let sessions = if path.is_file() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str(&text).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            inner: Mutex::new(sessions),
        })
    }

    /// Get the session for `key`, creating it with a fresh id when absent.
    pub async fn get_or_create(&self, key: &SessionKey, meta: &SessionMeta) -> Session {
        let mut sessions = self.inner.lock().await;
        if let Some(existing) = sessions.get(key.as_str()) {
            return existing.clone();
        }
        let session = Session::fresh(key, meta);
        info!(key = %key, session_id = %session.session_id, "created session");
        sessions.insert(key.as_str().to_string(), session.clone());
        self.persist(&sessions);
        session
    }

    pub async fn get(&self, key: &SessionKey) -> Option<Session> {
        self.inner.lock().await.get(key.as_str()).cloned()
    }

    /// Rotate the session: new id, same key.  The prior transcript is cleared
    /// by the caller; the model override is carried over.
    pub async fn rotate(&self, key: &SessionKey) -> Session {
        let mut sessions = self.inner.lock().await;
        let prior = sessions.get(key.as_str()).cloned();
        let mut fresh = Session::fresh(
            key,
            &prior
                .as_ref()
                .map(|p| SessionMeta {
                    channel: p.channel.clone(),
                    chat_type: p.chat_type,
                    group_id: p.group_id.clone(),
                    display_name: p.display_name.clone(),
                })
                .unwrap_or_default(),
        );
        fresh.primary_model_override = prior.and_then(|p| p.primary_model_override);
        info!(key = %key, session_id = %fresh.session_id, "rotated session");
        sessions.insert(key.as_str().to_string(), fresh.clone());
        self.persist(&sessions);
        fresh
    }

    /// Bump activity counters after a processed message.
    pub async fn touch(&self, key: &SessionKey, appended_messages: u64) {
        let mut sessions = self.inner.lock().await;
        if let Some(s) = sessions.get_mut(key.as_str()) {
            s.last_active_at = Utc::now();
            s.message_count += appended_messages;
            self.persist(&sessions);
        }
    }

    pub async fn set_model_override(&self, key: &SessionKey, provider: Option<String>) {
        let mut sessions = self.inner.lock().await;
        if let Some(s) = sessions.get_mut(key.as_str()) {
            s.primary_model_override = provider;
            self.persist(&sessions);
        }
    }

    pub async fn count(&self) -> usize {
        self.inner.lock().await.len()
    }

    fn persist(&self, sessions: &HashMap<String, Session>) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_yaml::to_string(sessions) {
            Ok(yaml) => {
                if let Err(e) = std::fs::write(&self.path, yaml) {
                    tracing::warn!(error = %e, "failed to persist session index");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize session index"),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
