// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Two-level context safety net applied before every provider call.
//!
//! L1 trims the interior of oversized tool results; L2 drops whole turns
//! from the oldest end until the estimated prompt fits the provider's
//! context window with headroom for the reply.  System messages are never
//! dropped.  Both levels are idempotent: running the guard twice with the
//! same limits yields the same output.

use owliabot_config::GuardConfig;
use tracing::debug;

use crate::{Message, Role};

/// Budget parameters for one guard pass.
#[derive(Debug, Clone, Copy)]
pub struct GuardLimits {
    /// Provider context window in tokens.
    pub context_window: usize,
    /// Output tokens requested from the provider.
    pub max_tokens: usize,
    /// Headroom kept free below the window.
    pub reserve_tokens: usize,
}

/// Result of a guard pass.
#[derive(Debug)]
pub struct GuardOutcome {
    pub messages: Vec<Message>,
    /// Number of messages removed by L2.
    pub dropped: usize,
}

const TRUNCATION_MARKER: &str = "\n…truncated…\n";

/// L1: clamp a single tool-result text to `max_chars`, keeping `head` leading
/// and `tail` trailing bytes around the marker.  Cuts land on char boundaries.
pub fn truncate_tool_result(text: &str, max_chars: usize, head: usize, tail: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }
    let head_end = floor_char_boundary(text, head.min(text.len()));
    let tail_start = ceil_char_boundary(text, text.len().saturating_sub(tail));
    let mut out = String::with_capacity(head_end + TRUNCATION_MARKER.len() + (text.len() - tail_start));
    out.push_str(&text[..head_end]);
    out.push_str(TRUNCATION_MARKER);
    out.push_str(&text[tail_start..]);
    out
}

/// Apply both guard levels and return the trimmed message list.
pub fn guard_context(
    mut messages: Vec<Message>,
    cfg: &GuardConfig,
    limits: GuardLimits,
) -> GuardOutcome {
    // L1: per tool-result truncation.
    for m in &mut messages {
        if let Some(results) = &mut m.tool_results {
            for r in results {
                let text = r.text();
                if text.len() > cfg.max_tool_result_chars {
                    r.set_text(truncate_tool_result(
                        &text,
                        cfg.max_tool_result_chars,
                        cfg.truncate_head_chars,
                        cfg.truncate_tail_chars,
                    ));
                }
            }
        }
    }

    // L2: drop oldest non-system turns until the estimate fits.
    let budget = limits
        .context_window
        .saturating_sub(limits.max_tokens)
        .saturating_sub(limits.reserve_tokens);
    let mut dropped = 0usize;
    while estimate_tokens(&messages) > budget {
        let Some(idx) = messages.iter().position(|m| m.role != Role::System) else {
            break; // only system messages left; nothing further to drop
        };
        let removed = messages.remove(idx);
        dropped += 1;
        // A dropped assistant tool-call message takes its bound results along:
        // a dangling tool-result without its call would be rejected by
        // provider APIs.
        if removed.has_tool_calls() {
            let ids: Vec<&str> = removed
                .tool_calls
                .as_ref()
                .map(|c| c.iter().map(|tc| tc.id.as_str()).collect())
                .unwrap_or_default();
            while idx < messages.len() {
                let bound = messages[idx]
                    .tool_results
                    .as_ref()
                    .is_some_and(|rs| rs.iter().any(|r| ids.contains(&r.tool_call_id.as_str())));
                if bound {
                    messages.remove(idx);
                    dropped += 1;
                } else {
                    break;
                }
            }
        }
    }

    if dropped > 0 {
        debug!(dropped, "context guard dropped old messages");
    }
    GuardOutcome { messages, dropped }
}

/// Token estimate for a message list: `⌈chars/4⌉` per message.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages.iter().map(|m| m.approx_tokens()).sum()
}

/// Well-known provider phrases that signal a hard context-size overflow.
pub fn is_context_overflow_message(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    const PHRASES: &[&str] = &[
        "prompt is too long",
        "context length",
        "context_length_exceeded",
        "maximum context",
        "input is too long",
        "exceeds the context window",
        "too many tokens",
    ];
    PHRASES.iter().any(|p| lower.contains(p))
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolResultRecord;
    use serde_json::json;

    fn guard_cfg() -> GuardConfig {
        GuardConfig {
            max_tool_result_chars: 100,
            truncate_head_chars: 40,
            truncate_tail_chars: 20,
            reserve_tokens: 10,
        }
    }

    fn tool_turn(id: &str, result_text: &str) -> (Message, Message) {
        let call = Message::assistant_with_calls(
            "",
            vec![crate::ToolCall {
                id: id.into(),
                name: "t".into(),
                arguments: json!({}),
            }],
        );
        let result = Message::tool_results(vec![ToolResultRecord {
            tool_call_id: id.into(),
            tool_name: "t".into(),
            success: true,
            data: Some(json!(result_text)),
            error: None,
        }]);
        (call, result)
    }

    // ── L1 ────────────────────────────────────────────────────────────────────

    #[test]
    fn short_tool_result_is_untouched() {
        let out = truncate_tool_result("short", 100, 40, 20);
        assert_eq!(out, "short");
    }

    #[test]
    fn long_tool_result_keeps_head_and_tail() {
        let text = "a".repeat(60) + &"b".repeat(60);
        let out = truncate_tool_result(&text, 100, 40, 20);
        assert!(out.starts_with(&"a".repeat(40)));
        assert!(out.ends_with(&"b".repeat(20)));
        assert!(out.contains("…truncated…"));
        assert!(out.len() < text.len());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "é".repeat(200); // 2 bytes per char
        let out = truncate_tool_result(&text, 100, 41, 21); // odd cut points
        assert!(out.contains("…truncated…"));
        // Must still be valid UTF-8 (would have panicked on slicing otherwise)
        assert!(out.chars().all(|c| c == 'é' || "…truncated…\n".contains(c)));
    }

    #[test]
    fn boundary_exactly_at_limit_is_untouched() {
        let text = "x".repeat(100);
        assert_eq!(truncate_tool_result(&text, 100, 40, 20), text);
    }

    // ── L2 ────────────────────────────────────────────────────────────────────

    #[test]
    fn guard_is_noop_when_under_budget() {
        let msgs = vec![Message::system("sys"), Message::user("hello")];
        let out = guard_context(
            msgs,
            &guard_cfg(),
            GuardLimits {
                context_window: 10_000,
                max_tokens: 100,
                reserve_tokens: 10,
            },
        );
        assert_eq!(out.dropped, 0);
        assert_eq!(out.messages.len(), 2);
    }

    #[test]
    fn guard_drops_oldest_non_system_first() {
        let msgs = vec![
            Message::system("sys"),
            Message::user(&"a".repeat(400)), // 100 tokens
            Message::assistant("b"),
            Message::user("latest"),
        ];
        let out = guard_context(
            msgs,
            &guard_cfg(),
            GuardLimits {
                context_window: 60,
                max_tokens: 10,
                reserve_tokens: 10,
            },
        );
        assert!(out.dropped >= 1);
        assert_eq!(out.messages[0].role, Role::System, "system survives");
        assert!(out.messages.iter().all(|m| m.content != "a".repeat(400)));
    }

    #[test]
    fn guard_never_drops_system_messages() {
        let msgs = vec![Message::system(&"s".repeat(4000)), Message::user("hi")];
        let out = guard_context(
            msgs,
            &guard_cfg(),
            GuardLimits {
                context_window: 50,
                max_tokens: 10,
                reserve_tokens: 10,
            },
        );
        assert!(out.messages.iter().any(|m| m.role == Role::System));
    }

    #[test]
    fn dropped_assistant_call_takes_bound_results_along() {
        let (call, result) = tool_turn("c1", &"r".repeat(400));
        let msgs = vec![
            Message::system("sys"),
            call,
            result,
            Message::assistant("done"),
            Message::user("next"),
        ];
        let out = guard_context(
            msgs,
            &guard_cfg(),
            GuardLimits {
                context_window: 40,
                max_tokens: 5,
                reserve_tokens: 5,
            },
        );
        // No orphan tool-result message may remain.
        assert!(out
            .messages
            .iter()
            .all(|m| !m.has_tool_results()), "orphan tool result left behind");
    }

    #[test]
    fn guard_is_idempotent() {
        let (call, result) = tool_turn("c1", &"r".repeat(400));
        let msgs = vec![Message::system("s"), call, result, Message::user("q")];
        let limits = GuardLimits {
            context_window: 100,
            max_tokens: 10,
            reserve_tokens: 10,
        };
        let once = guard_context(msgs, &guard_cfg(), limits);
        let count = once.messages.len();
        let twice = guard_context(once.messages, &guard_cfg(), limits);
        assert_eq!(twice.dropped, 0);
        assert_eq!(twice.messages.len(), count);
    }

    // ── Overflow detection ────────────────────────────────────────────────────

    #[test]
    fn overflow_phrases_are_detected() {
        assert!(is_context_overflow_message("Prompt is too long: 210000 tokens"));
        assert!(is_context_overflow_message("This model's maximum context length is 8192"));
        assert!(is_context_overflow_message("error: context_length_exceeded"));
    }

    #[test]
    fn unrelated_errors_are_not_overflow() {
        assert!(!is_context_overflow_message("connection reset by peer"));
        assert!(!is_context_overflow_message("invalid api key"));
    }
}
