// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use tokio::sync::Mutex;

use owliabot_model::{Message, Role};

/// Append-only JSON-lines transcript store, one file per session id.
///
/// The transcript is the conversation's ground truth: appends are atomic
/// with respect to each other (single mutex, whole-line writes) and flushed
/// before `append` returns.
pub struct TranscriptStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl TranscriptStore {
    pub fn open(state_dir: &std::path::Path) -> anyhow::Result<Self> {
        let dir = state_dir.join("transcripts");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating transcript directory {}", dir.display()))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.jsonl"))
    }

    pub async fn append(&self, session_id: &str, message: &Message) -> anyhow::Result<()> {
        let line = serde_json::to_string(message).context("serializing message")?;
        let _guard = self.write_lock.lock().await;
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(session_id))
            .with_context(|| format!("opening transcript for {session_id}"))?;
        f.write_all(line.as_bytes())?;
        f.write_all(b"\n")?;
        f.flush()?;
        Ok(())
    }

    /// Read the last `max_turns` turns.  A turn ends at each assistant
    /// message; an incomplete trailing turn counts as one turn and is always
    /// included.
    pub async fn get_history(&self, session_id: &str, max_turns: usize) -> Vec<Message> {
        let messages = self.read_all(session_id).await;
        let mut turns: Vec<Vec<Message>> = Vec::new();
        let mut current: Vec<Message> = Vec::new();
        for m in messages {
            let is_assistant = m.role == Role::Assistant;
            current.push(m);
            if is_assistant {
                turns.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            turns.push(current);
        }
        let skip = turns.len().saturating_sub(max_turns);
        turns.into_iter().skip(skip).flatten().collect()
    }

    /// Every message of the transcript, oldest first.
    pub async fn read_all(&self, session_id: &str) -> Vec<Message> {
        let path = self.path_for(session_id);
        let Ok(text) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    pub async fn clear(&self, session_id: &str) -> anyhow::Result<()> {
        let path = self.path_for(session_id);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("clearing transcript {}", path.display()))?;
        }
        Ok(())
    }

    /// Count of "real" user messages (tool-result carriers excluded).
    pub async fn real_user_message_count(&self, session_id: &str) -> usize {
        self.read_all(session_id)
            .await
            .iter()
            .filter(|m| m.is_real_user_message())
            .count()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
