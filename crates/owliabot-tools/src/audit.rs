// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Audit trail for tool executions.
//!
//! Every call through the executor produces exactly one record with a
//! terminal status.  Records are pre-logged before invocation (capturing the
//! start time and a truncated parameter preview) and finalized with the
//! outcome; completed records are appended to a JSON-lines file when the
//! logger is file-backed.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ToolContext;

/// Maximum characters of the serialized arguments kept in a record.
const PARAMS_PREVIEW_CHARS: usize = 100;

/// Terminal status of one audited tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Error,
    Denied,
    ToolNotFound,
    RateLimited,
    Cooldown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub tool: String,
    pub params_preview: String,
    pub user_id: String,
    pub session_key: String,
    pub channel: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AuditStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Which gate produced the decision (`policy`, `cooldown`, `write_gate`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_decision: Option<String>,
    /// Short outcome text (`denied`, error message, result size).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// Finalization payload.
#[derive(Debug, Default, Clone)]
pub struct AuditOutcome {
    pub duration_ms: Option<u64>,
    pub gate: Option<String>,
    pub gate_decision: Option<String>,
    pub result: Option<String>,
}

pub struct AuditLogger {
    path: Option<PathBuf>,
    pending: Mutex<HashMap<String, AuditRecord>>,
    completed: Mutex<Vec<AuditRecord>>,
}

impl AuditLogger {
    /// In-memory logger (tests, ephemeral runs).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            pending: Mutex::new(HashMap::new()),
            completed: Mutex::new(Vec::new()),
        }
    }

    /// File-backed logger appending JSON lines to `path`.
    pub fn file_backed(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            pending: Mutex::new(HashMap::new()),
            completed: Mutex::new(Vec::new()),
        }
    }

    /// Open a record before invocation.  Returns the audit id.
    pub fn pre_log(&self, tool: &str, args: &Value, ctx: &ToolContext) -> String {
        let id = Uuid::new_v4().to_string();
        let record = AuditRecord {
            id: id.clone(),
            tool: tool.to_string(),
            params_preview: truncate_preview(&args.to_string()),
            user_id: ctx.user_id.clone(),
            session_key: ctx.session_key.clone(),
            channel: ctx.channel.clone(),
            started_at: Utc::now(),
            finished_at: None,
            status: None,
            duration_ms: None,
            gate: None,
            gate_decision: None,
            result: None,
        };
        self.pending.lock().expect("audit lock").insert(id.clone(), record);
        id
    }

    /// Close a record with its terminal status.
    pub fn finalize(&self, audit_id: &str, status: AuditStatus, outcome: AuditOutcome) {
        let Some(mut record) = self.pending.lock().expect("audit lock").remove(audit_id) else {
            warn!(audit_id, "finalize called for unknown audit record");
            return;
        };
        record.finished_at = Some(Utc::now());
        record.status = Some(status);
        record.duration_ms = outcome.duration_ms;
        record.gate = outcome.gate;
        record.gate_decision = outcome.gate_decision;
        record.result = outcome.result;

        info!(
            tool = %record.tool,
            status = ?status,
            gate_decision = record.gate_decision.as_deref().unwrap_or(""),
            duration_ms = record.duration_ms.unwrap_or(0),
            "tool call audited"
        );
        if let Some(path) = &self.path {
            if let Err(e) = append_jsonl(path, &record) {
                warn!(error = %e, "failed to append audit record");
            }
        }
        self.completed.lock().expect("audit lock").push(record);
    }

    /// Completed records, oldest first.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.completed.lock().expect("audit lock").clone()
    }

    /// Number of records still awaiting finalize (should be 0 between calls).
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("audit lock").len()
    }
}

fn truncate_preview(s: &str) -> String {
    if s.len() <= PARAMS_PREVIEW_CHARS {
        return s.to_string();
    }
    let mut end = PARAMS_PREVIEW_CHARS;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

fn append_jsonl(path: &PathBuf, record: &AuditRecord) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    serde_json::to_writer(&mut f, record)?;
    f.write_all(b"\n")?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ToolContext {
        let mut c = ToolContext::internal("telegram");
        c.user_id = "u1".into();
        c.session_key = "agent:main:telegram:conv:main:main".into();
        c
    }

    #[test]
    fn pre_log_then_finalize_produces_one_record() {
        let log = AuditLogger::in_memory();
        let id = log.pre_log("todo__add", &json!({"text": "x"}), &ctx());
        assert_eq!(log.pending_count(), 1);
        log.finalize(
            &id,
            AuditStatus::Success,
            AuditOutcome {
                duration_ms: Some(12),
                ..AuditOutcome::default()
            },
        );
        assert_eq!(log.pending_count(), 0);
        let records = log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, Some(AuditStatus::Success));
        assert_eq!(records[0].duration_ms, Some(12));
    }

    #[test]
    fn params_preview_is_truncated_to_100_chars() {
        let log = AuditLogger::in_memory();
        let long = "x".repeat(500);
        let id = log.pre_log("t", &json!({ "payload": long }), &ctx());
        log.finalize(&id, AuditStatus::Success, AuditOutcome::default());
        let preview = &log.records()[0].params_preview;
        assert!(preview.chars().count() <= 101, "100 chars + ellipsis");
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn finalize_unknown_id_is_ignored() {
        let log = AuditLogger::in_memory();
        log.finalize("nope", AuditStatus::Error, AuditOutcome::default());
        assert!(log.records().is_empty());
    }

    #[test]
    fn denied_record_keeps_gate_decision() {
        let log = AuditLogger::in_memory();
        let id = log.pre_log("wallet__send", &json!({}), &ctx());
        log.finalize(
            &id,
            AuditStatus::Denied,
            AuditOutcome {
                gate: Some("write_gate".into()),
                gate_decision: Some("not_in_allowlist".into()),
                result: Some("denied".into()),
                ..AuditOutcome::default()
            },
        );
        let r = &log.records()[0];
        assert_eq!(r.gate_decision.as_deref(), Some("not_in_allowlist"));
        assert_eq!(r.result.as_deref(), Some("denied"));
    }

    #[test]
    fn file_backed_logger_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLogger::file_backed(path.clone());
        for status in [AuditStatus::Success, AuditStatus::Error] {
            let id = log.pre_log("t", &json!({}), &ctx());
            log.finalize(&id, status, AuditOutcome::default());
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: AuditRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.status, Some(AuditStatus::Success));
    }
}
