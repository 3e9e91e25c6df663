// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Slash commands, tried before the agentic loop.
//!
//! All commands are idempotent and non-agentic except for the one-shot
//! summarization `/new` performs before rotating the session.

use tracing::{info, warn};

use owliabot_config::Config;
use owliabot_core::{SessionKey, SessionMeta, SessionStore, TranscriptStore};
use owliabot_model::{Message, ProviderRunner, RunOptions};

use crate::InfraStore;

/// Command dependencies borrowed from the gateway.
pub struct CommandDeps<'a> {
    pub config: &'a Config,
    pub sessions: &'a SessionStore,
    pub transcripts: &'a TranscriptStore,
    pub infra: &'a InfraStore,
    pub runner: &'a ProviderRunner,
}

/// Try to handle `body` as a slash command.  Returns the reply text when
/// handled; `None` falls through to the agentic loop.
pub async fn try_handle_command(
    body: &str,
    key: &SessionKey,
    meta: &SessionMeta,
    deps: CommandDeps<'_>,
) -> Option<String> {
    let trimmed = body.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let command = trimmed.split_whitespace().next().unwrap_or(trimmed);
    match command {
        "/new" => Some(handle_new(key, meta, &deps).await),
        "/status" => Some(handle_status(&deps).await),
        "/history" => Some(handle_history(key, meta, &deps).await),
        "/help" => Some(handle_help()),
        _ => None,
    }
}

async fn handle_new(key: &SessionKey, meta: &SessionMeta, deps: &CommandDeps<'_>) -> String {
    let session = deps.sessions.get_or_create(key, meta).await;
    let old_session_id = session.session_id.clone();

    let real_user_messages = deps.transcripts.real_user_message_count(&old_session_id).await;
    if real_user_messages >= 2 && deps.config.session.summarize_on_reset {
        summarize_session(&old_session_id, deps).await;
    }

    deps.sessions.rotate(key).await;
    if let Err(e) = deps.transcripts.clear(&old_session_id).await {
        warn!(error = %e, "failed to clear prior transcript");
    }
    deps.runner.cli_runner().forget_session(key.as_str());
    "✅ Started a new session.".to_string()
}

/// One-shot summarization over the conversation being reset.  Best-effort:
/// a failed summary never blocks the rotation.
async fn summarize_session(session_id: &str, deps: &CommandDeps<'_>) {
    let transcript = deps.transcripts.read_all(session_id).await;
    let mut prompt =
        String::from("Summarize the key points of this conversation for future reference:\n\n");
    for m in &transcript {
        if m.is_real_user_message() {
            prompt.push_str("User: ");
            prompt.push_str(&m.content);
            prompt.push('\n');
        } else if m.role == owliabot_model::Role::Assistant && !m.content.is_empty() {
            prompt.push_str("Assistant: ");
            prompt.push_str(&m.content);
            prompt.push('\n');
        }
    }
    match deps
        .runner
        .run(&[Message::user(prompt)], &RunOptions::default())
        .await
    {
        Ok(resp) => info!(session_id, summary = %resp.content, "session summarized before reset"),
        Err(e) => warn!(session_id, error = %e, "session summarization failed"),
    }
}

async fn handle_status(deps: &CommandDeps<'_>) -> String {
    let mut out = String::from("OwliaBot status\n\nProviders (failover order):\n");
    for (i, id) in deps.runner.provider_ids().iter().enumerate() {
        out.push_str(&format!("  {}. {id}\n", i + 1));
    }
    out.push_str("\nChannels:\n");
    if deps.config.channels.telegram.enabled {
        out.push_str("  telegram: enabled\n");
    }
    if deps.config.channels.discord.enabled {
        out.push_str("  discord: enabled\n");
    }
    if deps.config.gateway.enabled {
        out.push_str(&format!(
            "  http: {}:{}\n",
            deps.config.gateway.host, deps.config.gateway.port
        ));
    }
    out.push_str(&format!(
        "\nSessions: {}\nEvents in log: {}\n",
        deps.sessions.count().await,
        deps.infra.event_count()
    ));
    out
}

async fn handle_history(key: &SessionKey, meta: &SessionMeta, deps: &CommandDeps<'_>) -> String {
    let session = deps.sessions.get_or_create(key, meta).await;
    let history = deps
        .transcripts
        .get_history(&session.session_id, deps.config.session.max_turns)
        .await;
    if history.is_empty() {
        return "No history in the current session.".to_string();
    }
    let mut out = String::from("Recent conversation:\n");
    for m in history.iter().filter(|m| !m.content.is_empty()) {
        let role = match m.role {
            owliabot_model::Role::User => "User",
            owliabot_model::Role::Assistant => "Assistant",
            owliabot_model::Role::System => continue,
        };
        let mut text = m.content.clone();
        if text.chars().count() > 80 {
            text = text.chars().take(80).collect::<String>() + "…";
        }
        out.push_str(&format!("{role}: {text}\n"));
    }
    out
}

fn handle_help() -> String {
    "Available commands:\n\
     /new — start a new session (summarizes the current one first)\n\
     /status — show provider and channel status\n\
     /history — show the recent conversation\n\
     /help — show this help"
        .to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use owliabot_core::ChatType;
    use owliabot_model::{LlmResponse, ModelProvider, ProviderError, ScriptedMockProvider};
    use owliabot_config::ProviderConfig;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct Fixture {
        _dir: tempfile::TempDir,
        config: Arc<Config>,
        sessions: Arc<SessionStore>,
        transcripts: Arc<TranscriptStore>,
        infra: Arc<InfraStore>,
        runner: Arc<ProviderRunner>,
        mock: Arc<ScriptedMockProvider>,
    }

    fn fixture(script: Vec<Result<LlmResponse, ProviderError>>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.agent.state_dir = Some(dir.path().to_path_buf());
        config.providers.push(ProviderConfig {
            id: "mock".into(),
            model: "m".into(),
            api_key: Some("k".into()),
            api_key_env: None,
            priority: 1,
            base_url: None,
            max_tokens: Some(128),
            temperature: None,
            context_window: Some(100_000),
            reasoning: None,
        });
        let config = Arc::new(config);
        let mock = Arc::new(ScriptedMockProvider::new("mock", script));
        let mut drivers: HashMap<String, Arc<dyn ModelProvider>> = HashMap::new();
        drivers.insert("mock".into(), mock.clone());
        Fixture {
            sessions: Arc::new(SessionStore::open(dir.path()).unwrap()),
            transcripts: Arc::new(TranscriptStore::open(dir.path()).unwrap()),
            infra: Arc::new(InfraStore::new()),
            runner: Arc::new(ProviderRunner::with_drivers(config.clone(), drivers)),
            config,
            mock,
            _dir: dir,
        }
    }

    impl Fixture {
        fn deps(&self) -> CommandDeps<'_> {
            CommandDeps {
                config: &self.config,
                sessions: &self.sessions,
                transcripts: &self.transcripts,
                infra: &self.infra,
                runner: &self.runner,
            }
        }
    }

    fn key() -> SessionKey {
        SessionKey::direct("main", "telegram")
    }

    fn meta() -> SessionMeta {
        SessionMeta {
            channel: "telegram".into(),
            chat_type: ChatType::Direct,
            group_id: None,
            display_name: None,
        }
    }

    #[tokio::test]
    async fn non_command_falls_through() {
        let f = fixture(vec![]);
        assert!(try_handle_command("hello", &key(), &meta(), f.deps()).await.is_none());
        assert!(try_handle_command("/unknown", &key(), &meta(), f.deps()).await.is_none());
    }

    #[tokio::test]
    async fn help_lists_commands() {
        let f = fixture(vec![]);
        let reply = try_handle_command("/help", &key(), &meta(), f.deps()).await.unwrap();
        assert!(reply.contains("/new"));
        assert!(reply.contains("/status"));
    }

    #[tokio::test]
    async fn new_rotates_session_and_clears_transcript() {
        let f = fixture(vec![]);
        let old = f.sessions.get_or_create(&key(), &meta()).await;
        f.transcripts.append(&old.session_id, &Message::user("only one")).await.unwrap();
        try_handle_command("/new", &key(), &meta(), f.deps()).await.unwrap();
        let fresh = f.sessions.get(&key()).await.unwrap();
        assert_ne!(fresh.session_id, old.session_id);
        assert!(f.transcripts.read_all(&old.session_id).await.is_empty());
        // One user message → below the summarization threshold → no LLM call.
        assert_eq!(f.mock.call_count(), 0);
    }

    #[tokio::test]
    async fn new_with_enough_history_summarizes_once() {
        // The summarization prompt must contain each original user utterance.
        let f = fixture(vec![Ok(LlmResponse::text("mock", "m", "summary"))]);
        let old = f.sessions.get_or_create(&key(), &meta()).await;
        for i in 0..5 {
            f.transcripts
                .append(&old.session_id, &Message::user(format!("question-{i}")))
                .await
                .unwrap();
            f.transcripts
                .append(&old.session_id, &Message::assistant(format!("answer-{i}")))
                .await
                .unwrap();
        }
        try_handle_command("/new", &key(), &meta(), f.deps()).await.unwrap();
        assert_eq!(f.mock.call_count(), 1, "exactly one summarization call");
        assert!(f.transcripts.read_all(&old.session_id).await.is_empty());
        assert_ne!(
            f.sessions.get(&key()).await.unwrap().session_id,
            old.session_id
        );
    }

    #[tokio::test]
    async fn new_skips_summarization_when_disabled() {
        let mut f = fixture(vec![Ok(LlmResponse::text("mock", "m", "summary"))]);
        let mut cfg = (*f.config).clone();
        cfg.session.summarize_on_reset = false;
        f.config = Arc::new(cfg);
        let old = f.sessions.get_or_create(&key(), &meta()).await;
        for i in 0..3 {
            f.transcripts
                .append(&old.session_id, &Message::user(format!("q{i}")))
                .await
                .unwrap();
        }
        try_handle_command("/new", &key(), &meta(), f.deps()).await.unwrap();
        assert_eq!(f.mock.call_count(), 0);
    }

    #[tokio::test]
    async fn status_renders_providers_and_counters() {
        let f = fixture(vec![]);
        let reply = try_handle_command("/status", &key(), &meta(), f.deps()).await.unwrap();
        assert!(reply.contains("mock"));
        assert!(reply.contains("Sessions"));
    }

    #[tokio::test]
    async fn history_shows_recent_messages() {
        let f = fixture(vec![]);
        let s = f.sessions.get_or_create(&key(), &meta()).await;
        f.transcripts.append(&s.session_id, &Message::user("ping")).await.unwrap();
        f.transcripts.append(&s.session_id, &Message::assistant("pong")).await.unwrap();
        let reply = try_handle_command("/history", &key(), &meta(), f.deps()).await.unwrap();
        assert!(reply.contains("ping"));
        assert!(reply.contains("pong"));
    }
}
