// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Sub-process CLI backends (`claude`, `codex`, user-defined).
//!
//! The runner composes an argument list from the backend's templates, spawns
//! the command with a scrubbed environment, and parses stdout according to
//! the configured output format.  Backends marked `serialize` run under a
//! per-command FIFO queue.  Timeouts escalate SIGTERM → SIGKILL.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use owliabot_config::{CliBackendConfig, CliInputMode, CliOutputFormat, CliSessionMode, SystemPromptWhen};

use crate::ProviderError;

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// One CLI invocation request.
#[derive(Debug, Clone)]
pub struct CliRunArgs<'a> {
    pub backend_id: &'a str,
    pub model: &'a str,
    pub prompt: &'a str,
    pub system_prompt: &'a str,
    pub is_first_message: bool,
    /// Internal session key used to resume the CLI's own session.
    pub session_key: Option<&'a str>,
}

/// Parsed result of one CLI invocation.
#[derive(Debug, Clone)]
pub struct CliRunOutcome {
    pub text: String,
    /// Session id reported by the CLI, stored for resumption.
    pub cli_session_id: Option<String>,
}

/// Executes configured CLI backends and tracks their session ids.
pub struct CliRunner {
    backends: HashMap<String, CliBackendConfig>,
    /// internal session key → CLI session id
    sessions: DashMap<String, String>,
    /// Per-command serialization queues (FIFO, one in-flight at a time).
    queues: DashMap<String, Arc<Mutex<()>>>,
}

impl CliRunner {
    pub fn new(backends: HashMap<String, CliBackendConfig>) -> Self {
        Self {
            backends,
            sessions: DashMap::new(),
            queues: DashMap::new(),
        }
    }

    pub fn has_backend(&self, id: &str) -> bool {
        self.backends.contains_key(id)
    }

    /// Run one CLI completion.
    pub async fn run(
        &self,
        args: CliRunArgs<'_>,
        cancel: Option<tokio::sync::watch::Receiver<bool>>,
    ) -> Result<CliRunOutcome, ProviderError> {
        let cfg = self
            .backends
            .get(args.backend_id)
            .ok_or_else(|| ProviderError::Api(format!("unknown CLI backend: {}", args.backend_id)))?;

        let prior_session = args
            .session_key
            .and_then(|k| self.sessions.get(k).map(|v| v.clone()));

        let (argv, use_stdin) = build_argv(cfg, &args, prior_session.as_deref());
        debug!(command = %cfg.command, ?argv, use_stdin, "invoking CLI backend");

        // Serialized backends hold their queue for the whole process lifetime.
        // The map guard is dropped before awaiting the queue lock.
        let queue = cfg.serialize.then(|| {
            self.queues
                .entry(cfg.command.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        });
        let _permit = match queue {
            Some(q) => Some(q.lock_owned().await),
            None => None,
        };

        let raw = spawn_and_collect(cfg, &argv, use_stdin.then_some(args.prompt), cancel).await?;
        let outcome = parse_output(cfg, &raw)?;

        if let (Some(key), Some(id)) = (args.session_key, &outcome.cli_session_id) {
            self.sessions.insert(key.to_string(), id.clone());
        }
        Ok(outcome)
    }

    /// Forget the stored CLI session for a key (e.g. after `/new`).
    pub fn forget_session(&self, session_key: &str) {
        self.sessions.remove(session_key);
    }
}

// ─── Argument composition ─────────────────────────────────────────────────────

/// Compose the argument list.  Returns `(argv, prompt_via_stdin)`.
fn build_argv(
    cfg: &CliBackendConfig,
    args: &CliRunArgs<'_>,
    prior_session: Option<&str>,
) -> (Vec<String>, bool) {
    let mut argv: Vec<String> = cfg.base_args.clone();

    if let Some(session_id) = prior_session {
        if cfg.session_mode != CliSessionMode::None {
            for a in &cfg.resume_args {
                argv.push(a.replace("{sessionId}", session_id));
            }
        }
    }

    if let Some(flag) = &cfg.model_flag {
        let model = cfg
            .model_aliases
            .get(args.model)
            .map(String::as_str)
            .unwrap_or(args.model);
        argv.push(flag.clone());
        argv.push(model.to_string());
    }

    let inject_system = !args.system_prompt.is_empty()
        && match cfg.system_prompt_when {
            SystemPromptWhen::Always => true,
            SystemPromptWhen::First => args.is_first_message,
        };
    if inject_system {
        if let Some(flag) = &cfg.system_prompt_flag {
            argv.push(flag.clone());
            argv.push(args.system_prompt.to_string());
        }
    }

    let use_stdin =
        cfg.input == CliInputMode::Stdin || args.prompt.len() > cfg.max_prompt_arg_chars;
    if !use_stdin {
        argv.push(args.prompt.to_string());
    }
    (argv, use_stdin)
}

// ─── Process management ───────────────────────────────────────────────────────

struct RawOutput {
    stdout: String,
    stderr: String,
    exit_code: i32,
}

async fn spawn_and_collect(
    cfg: &CliBackendConfig,
    argv: &[String],
    stdin_payload: Option<&str>,
    cancel: Option<tokio::sync::watch::Receiver<bool>>,
) -> Result<RawOutput, ProviderError> {
    let mut cmd = tokio::process::Command::new(&cfg.command);
    cmd.args(argv)
        .stdin(if stdin_payload.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for key in &cfg.clear_env {
        cmd.env_remove(key);
    }

    let mut child = cmd.spawn().map_err(|e| ProviderError::Spawn {
        command: cfg.command.clone(),
        source: e,
    })?;
    let pid = child.id();

    if let Some(payload) = stdin_payload {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload.as_bytes()).await?;
            // Dropping the handle closes the pipe so the child sees EOF.
        }
    }

    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");
    let out_task = tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf).await;
        buf
    });
    let err_task = tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    });

    enum WaitOutcome {
        Exited(std::process::ExitStatus),
        TimedOut,
        Cancelled,
    }

    let deadline = Duration::from_millis(cfg.timeout_ms);
    // The select only tags the outcome; the losing futures (and with them the
    // borrow of `child`) are dropped before the escalation path runs.
    let outcome = {
        let cancelled = wait_cancelled(cancel);
        tokio::pin!(cancelled);
        tokio::select! {
            s = child.wait() => WaitOutcome::Exited(s?),
            _ = tokio::time::sleep(deadline) => WaitOutcome::TimedOut,
            _ = &mut cancelled => WaitOutcome::Cancelled,
        }
    };

    let status = match outcome {
        WaitOutcome::Exited(status) => status,
        WaitOutcome::TimedOut => {
            warn!(command = %cfg.command, timeout_ms = cfg.timeout_ms, "CLI timed out; sending SIGTERM");
            terminate(pid);
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
                child.kill().await.ok();
            }
            return Err(ProviderError::Timeout);
        }
        WaitOutcome::Cancelled => {
            terminate(pid);
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
                child.kill().await.ok();
            }
            return Err(ProviderError::Cancelled);
        }
    };

    let stdout = out_task.await.unwrap_or_default();
    let stderr = err_task.await.unwrap_or_default();
    Ok(RawOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code: status.code().unwrap_or(-1),
    })
}

async fn wait_cancelled(cancel: Option<tokio::sync::watch::Receiver<bool>>) {
    match cancel {
        Some(mut rx) => {
            let _ = rx.wait_for(|c| *c).await;
        }
        None => std::future::pending().await,
    }
}

fn terminate(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

// ─── Output parsing ───────────────────────────────────────────────────────────

fn parse_output(cfg: &CliBackendConfig, raw: &RawOutput) -> Result<CliRunOutcome, ProviderError> {
    let (text, session_id) = match cfg.output {
        CliOutputFormat::Text => (non_empty(raw.stdout.trim().to_string()), None),
        CliOutputFormat::Json => match serde_json::from_str::<Value>(raw.stdout.trim()) {
            Ok(v) => (
                extract_json_text(&v),
                extract_session_id(&v, &cfg.session_id_fields),
            ),
            Err(_) => (None, None),
        },
        CliOutputFormat::Jsonl => {
            let mut text = String::new();
            let mut session_id = None;
            for line in raw.stdout.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Ok(v) = serde_json::from_str::<Value>(line) else {
                    continue;
                };
                for path in ["text", "content", "delta.text"] {
                    if let Some(s) = json_path(&v, path).and_then(Value::as_str) {
                        text.push_str(s);
                        break;
                    }
                }
                if session_id.is_none() {
                    session_id = extract_session_id(&v, &cfg.session_id_fields);
                }
            }
            (non_empty(text), session_id)
        }
    };

    // A non-zero exit with extractable output is still surfaced as success;
    // some CLIs write a complete result and then exit non-zero on cleanup.
    match text {
        Some(text) => {
            if raw.exit_code != 0 {
                warn!(
                    command = %cfg.command,
                    exit_code = raw.exit_code,
                    "CLI exited non-zero but produced a valid result"
                );
            }
            Ok(CliRunOutcome {
                text,
                cli_session_id: session_id,
            })
        }
        None if raw.exit_code != 0 => Err(ProviderError::Api(format!(
            "Error: CLI exited with code {}. {}",
            raw.exit_code,
            raw.stderr.trim()
        ))),
        None => Ok(CliRunOutcome {
            text: String::new(),
            cli_session_id: session_id,
        }),
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Extract the reply text from a single JSON object, probing the well-known
/// result paths in order and falling back to a recursive search under
/// `message`.
fn extract_json_text(v: &Value) -> Option<String> {
    for path in ["result", "result.text", "text", "content"] {
        match json_path(v, path) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            _ => {}
        }
    }
    v.get("message").and_then(find_text_recursive)
}

/// Depth-first search for the first non-empty string under `text` / `content`
/// keys (arrays included).
fn find_text_recursive(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => {
            for key in ["text", "content", "message"] {
                if let Some(found) = map.get(key).and_then(find_text_recursive) {
                    return Some(found);
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(find_text_recursive),
        _ => None,
    }
}

fn extract_session_id(v: &Value, fields: &[String]) -> Option<String> {
    fields
        .iter()
        .find_map(|f| json_path(v, f).and_then(Value::as_str).map(str::to_string))
}

/// Resolve a dot-separated path in a JSON value.
fn json_path<'a>(v: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = v;
    for seg in path.split('.') {
        cur = cur.get(seg)?;
    }
    Some(cur)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend(yaml: &str) -> CliBackendConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn run_args<'a>(prompt: &'a str) -> CliRunArgs<'a> {
        CliRunArgs {
            backend_id: "claude-cli",
            model: "opus",
            prompt,
            system_prompt: "be brief",
            is_first_message: true,
            session_key: None,
        }
    }

    // ── Argument composition ──────────────────────────────────────────────────

    #[test]
    fn argv_contains_base_args_model_and_prompt() {
        let cfg = backend(
            "command: claude\nbase_args: ['-p']\nmodel_flag: '--model'\nmodel_aliases:\n  opus: claude-opus\n",
        );
        let (argv, stdin) = build_argv(&cfg, &run_args("hello"), None);
        assert_eq!(argv, vec!["-p", "--model", "claude-opus", "hello"]);
        assert!(!stdin);
    }

    #[test]
    fn unknown_model_alias_passes_through() {
        let cfg = backend("command: claude\nmodel_flag: '--model'");
        let (argv, _) = build_argv(&cfg, &run_args("x"), None);
        assert!(argv.contains(&"opus".to_string()));
    }

    #[test]
    fn resume_args_substitute_session_placeholder() {
        let cfg = backend("command: claude\nresume_args: ['--resume', '{sessionId}']");
        let (argv, _) = build_argv(&cfg, &run_args("x"), Some("sess-9"));
        assert_eq!(argv[0], "--resume");
        assert_eq!(argv[1], "sess-9");
    }

    #[test]
    fn session_mode_none_skips_resume_args() {
        let cfg = backend(
            "command: claude\nsession_mode: none\nresume_args: ['--resume', '{sessionId}']",
        );
        let (argv, _) = build_argv(&cfg, &run_args("x"), Some("sess-9"));
        assert!(!argv.iter().any(|a| a.contains("sess-9")));
    }

    #[test]
    fn system_prompt_first_only_injects_on_first_message() {
        let cfg = backend(
            "command: claude\nsystem_prompt_flag: '--system'\nsystem_prompt_when: first",
        );
        let mut args = run_args("x");
        let (argv, _) = build_argv(&cfg, &args, None);
        assert!(argv.contains(&"--system".to_string()));
        args.is_first_message = false;
        let (argv, _) = build_argv(&cfg, &args, None);
        assert!(!argv.contains(&"--system".to_string()));
    }

    #[test]
    fn prompt_at_limit_stays_on_argv() {
        let cfg = backend("command: claude\nmax_prompt_arg_chars: 10");
        let prompt = "a".repeat(10);
        let (argv, stdin) = build_argv(&cfg, &run_args(&prompt), None);
        assert!(!stdin);
        assert_eq!(argv.last().unwrap(), &prompt);
    }

    #[test]
    fn prompt_over_limit_moves_to_stdin() {
        let cfg = backend("command: claude\nmax_prompt_arg_chars: 10");
        let prompt = "a".repeat(11);
        let (argv, stdin) = build_argv(&cfg, &run_args(&prompt), None);
        assert!(stdin);
        assert!(!argv.contains(&prompt));
    }

    // ── Output parsing ────────────────────────────────────────────────────────

    fn raw(stdout: &str, exit_code: i32) -> RawOutput {
        RawOutput {
            stdout: stdout.into(),
            stderr: "boom".into(),
            exit_code,
        }
    }

    #[test]
    fn text_output_is_trimmed_stdout() {
        let cfg = backend("command: c");
        let out = parse_output(&cfg, &raw("  hello \n", 0)).unwrap();
        assert_eq!(out.text, "hello");
    }

    #[test]
    fn json_output_extracts_result_path() {
        let cfg = backend("command: c\noutput: json\nsession_id_fields: ['session_id']");
        let body = json!({ "result": "answer", "session_id": "s-1" }).to_string();
        let out = parse_output(&cfg, &raw(&body, 0)).unwrap();
        assert_eq!(out.text, "answer");
        assert_eq!(out.cli_session_id.as_deref(), Some("s-1"));
    }

    #[test]
    fn json_output_falls_back_to_message_recursion() {
        let cfg = backend("command: c\noutput: json");
        let body = json!({ "message": { "content": [{ "text": "deep" }] } }).to_string();
        let out = parse_output(&cfg, &raw(&body, 0)).unwrap();
        assert_eq!(out.text, "deep");
    }

    #[test]
    fn jsonl_output_concatenates_deltas() {
        let cfg = backend("command: c\noutput: jsonl");
        let body = "{\"delta\":{\"text\":\"he\"}}\n{\"text\":\"llo\"}\n";
        let out = parse_output(&cfg, &raw(body, 0)).unwrap();
        assert_eq!(out.text, "hello");
    }

    #[test]
    fn nonzero_exit_with_valid_json_is_success() {
        let cfg = backend("command: c\noutput: json");
        let body = json!({ "result": "done" }).to_string();
        let out = parse_output(&cfg, &raw(&body, 3)).unwrap();
        assert_eq!(out.text, "done");
    }

    #[test]
    fn nonzero_exit_without_output_surfaces_stderr() {
        let cfg = backend("command: c");
        let err = parse_output(&cfg, &raw("", 2)).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exited with code 2"), "{msg}");
        assert!(msg.contains("boom"));
    }

    // ── End-to-end against /bin/sh ────────────────────────────────────────────

    #[tokio::test]
    async fn run_executes_real_command() {
        let mut backends = HashMap::new();
        backends.insert("sh-cli".to_string(), backend("command: /bin/echo"));
        let runner = CliRunner::new(backends);
        let out = runner
            .run(
                CliRunArgs {
                    backend_id: "sh-cli",
                    model: "m",
                    prompt: "ping",
                    system_prompt: "",
                    is_first_message: true,
                    session_key: None,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.text, "ping");
    }

    #[tokio::test]
    async fn run_times_out_slow_command() {
        let mut backends = HashMap::new();
        backends.insert(
            "slow".to_string(),
            backend("command: /bin/sleep\nbase_args: ['5']\ntimeout_ms: 100\ninput: stdin"),
        );
        let runner = CliRunner::new(backends);
        let err = runner
            .run(
                CliRunArgs {
                    backend_id: "slow",
                    model: "m",
                    prompt: "",
                    system_prompt: "",
                    is_first_message: true,
                    session_key: None,
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout));
    }

    #[tokio::test]
    async fn run_remembers_session_id_for_key() {
        let mut backends = HashMap::new();
        // echo emits the JSON body passed as the prompt argument.
        backends.insert(
            "j".to_string(),
            backend("command: /bin/echo\noutput: json\nsession_id_fields: ['session_id']"),
        );
        let runner = CliRunner::new(backends);
        let body = json!({ "result": "ok", "session_id": "cli-7" }).to_string();
        runner
            .run(
                CliRunArgs {
                    backend_id: "j",
                    model: "m",
                    prompt: &body,
                    system_prompt: "",
                    is_first_message: true,
                    session_key: Some("agent:main:http:conv:main:main"),
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            runner
                .sessions
                .get("agent:main:http:conv:main:main")
                .map(|v| v.clone()),
            Some("cli-7".to_string())
        );
        runner.forget_session("agent:main:http:conv:main:main");
        assert!(runner.sessions.get("agent:main:http:conv:main:main").is_none());
    }
}
