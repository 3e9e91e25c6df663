// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use owliabot_config::ToolsConfig;

/// Outcome of a cooldown check.
#[derive(Debug, Clone, Copy)]
pub struct CooldownCheck {
    pub allowed: bool,
    /// Milliseconds until the tool may run again (0 when allowed).
    pub retry_after_ms: u64,
}

/// Per-(tool, session) cooldown tracking.
///
/// Only successful executions arm the cooldown; denied or failed calls do
/// not, so a user is never locked out by a failing tool.
pub struct CooldownTracker {
    default_ms: u64,
    per_tool: HashMap<String, u64>,
    last_run: Mutex<HashMap<(String, String), DateTime<Utc>>>,
}

impl CooldownTracker {
    pub fn from_config(cfg: &ToolsConfig) -> Self {
        Self {
            default_ms: cfg.cooldown_ms,
            per_tool: cfg.cooldowns.clone(),
            last_run: Mutex::new(HashMap::new()),
        }
    }

    fn cooldown_for(&self, tool: &str) -> u64 {
        self.per_tool.get(tool).copied().unwrap_or(self.default_ms)
    }

    pub fn check(&self, tool: &str, session_key: &str) -> CooldownCheck {
        self.check_at(tool, session_key, Utc::now())
    }

    pub fn check_at(&self, tool: &str, session_key: &str, now: DateTime<Utc>) -> CooldownCheck {
        let cooldown_ms = self.cooldown_for(tool);
        if cooldown_ms == 0 {
            return CooldownCheck {
                allowed: true,
                retry_after_ms: 0,
            };
        }
        let key = (tool.to_string(), session_key.to_string());
        let last = self.last_run.lock().expect("cooldown lock").get(&key).copied();
        match last {
            Some(at) => {
                let ready_at = at + Duration::milliseconds(cooldown_ms as i64);
                if now >= ready_at {
                    CooldownCheck {
                        allowed: true,
                        retry_after_ms: 0,
                    }
                } else {
                    CooldownCheck {
                        allowed: false,
                        retry_after_ms: (ready_at - now).num_milliseconds().max(0) as u64,
                    }
                }
            }
            None => CooldownCheck {
                allowed: true,
                retry_after_ms: 0,
            },
        }
    }

    pub fn record(&self, tool: &str, session_key: &str) {
        self.record_at(tool, session_key, Utc::now());
    }

    pub fn record_at(&self, tool: &str, session_key: &str, now: DateTime<Utc>) {
        self.last_run
            .lock()
            .expect("cooldown lock")
            .insert((tool.to_string(), session_key.to_string()), now);
    }
}

// ─── Tool-call rate limit ─────────────────────────────────────────────────────

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy)]
pub struct RateCheck {
    pub allowed: bool,
    /// Milliseconds until the window resets (0 when allowed).
    pub retry_after_ms: u64,
}

/// Fixed-window cap on tool calls per session, all tools combined.
///
/// Unlike the cooldown tracker this counts attempts, not successes: a model
/// that spams failing calls is throttled the same as one that spams working
/// ones.  `max_calls = 0` disables the limiter.
pub struct ToolCallLimiter {
    window_ms: u64,
    max_calls: u32,
    windows: Mutex<HashMap<String, (DateTime<Utc>, u32)>>,
}

impl ToolCallLimiter {
    pub fn from_config(cfg: &ToolsConfig) -> Self {
        Self {
            window_ms: cfg.rate_limit_window_ms,
            max_calls: cfg.rate_limit_max_calls,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, session_key: &str) -> RateCheck {
        self.check_at(session_key, Utc::now())
    }

    pub fn check_at(&self, session_key: &str, now: DateTime<Utc>) -> RateCheck {
        if self.max_calls == 0 {
            return RateCheck {
                allowed: true,
                retry_after_ms: 0,
            };
        }
        let mut windows = self.windows.lock().expect("rate lock");
        let window = Duration::milliseconds(self.window_ms as i64);
        let entry = windows
            .entry(session_key.to_string())
            .or_insert((now, 0));
        if now >= entry.0 + window {
            *entry = (now, 0);
        }
        if entry.1 >= self.max_calls {
            return RateCheck {
                allowed: false,
                retry_after_ms: ((entry.0 + window) - now).num_milliseconds().max(0) as u64,
            };
        }
        entry.1 += 1;
        RateCheck {
            allowed: true,
            retry_after_ms: 0,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(default_ms: u64, per_tool: &[(&str, u64)]) -> CooldownTracker {
        CooldownTracker::from_config(&ToolsConfig {
            cooldown_ms: default_ms,
            cooldowns: per_tool
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            ..ToolsConfig::default()
        })
    }

    #[test]
    fn zero_cooldown_always_allows() {
        let t = tracker(0, &[]);
        t.record("a", "s");
        assert!(t.check("a", "s").allowed);
    }

    #[test]
    fn first_call_is_always_allowed() {
        let t = tracker(10_000, &[]);
        assert!(t.check("a", "s").allowed);
    }

    #[test]
    fn call_within_cooldown_is_blocked_with_retry_hint() {
        let t = tracker(10_000, &[]);
        let now = Utc::now();
        t.record_at("a", "s", now);
        let check = t.check_at("a", "s", now + Duration::milliseconds(4_000));
        assert!(!check.allowed);
        assert!(check.retry_after_ms > 0 && check.retry_after_ms <= 6_000);
    }

    #[test]
    fn call_after_cooldown_is_allowed() {
        let t = tracker(10_000, &[]);
        let now = Utc::now();
        t.record_at("a", "s", now);
        assert!(t.check_at("a", "s", now + Duration::milliseconds(10_000)).allowed);
    }

    #[test]
    fn sessions_are_independent() {
        let t = tracker(10_000, &[]);
        let now = Utc::now();
        t.record_at("a", "s1", now);
        assert!(t.check_at("a", "s2", now).allowed);
    }

    #[test]
    fn per_tool_override_wins_over_default() {
        let t = tracker(0, &[("expensive", 60_000)]);
        let now = Utc::now();
        t.record_at("expensive", "s", now);
        t.record_at("cheap", "s", now);
        assert!(!t.check_at("expensive", "s", now + Duration::milliseconds(100)).allowed);
        assert!(t.check_at("cheap", "s", now + Duration::milliseconds(100)).allowed);
    }

    // ── Tool-call rate limit ──────────────────────────────────────────────────

    fn limiter(max_calls: u32, window_ms: u64) -> ToolCallLimiter {
        ToolCallLimiter::from_config(&ToolsConfig {
            rate_limit_max_calls: max_calls,
            rate_limit_window_ms: window_ms,
            ..ToolsConfig::default()
        })
    }

    #[test]
    fn limiter_disabled_by_default_allows_everything() {
        let l = ToolCallLimiter::from_config(&ToolsConfig::default());
        for _ in 0..1000 {
            assert!(l.check("s").allowed);
        }
    }

    #[test]
    fn limiter_blocks_call_past_the_cap() {
        let l = limiter(3, 60_000);
        let now = Utc::now();
        for _ in 0..3 {
            assert!(l.check_at("s", now).allowed);
        }
        let denied = l.check_at("s", now);
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms > 0 && denied.retry_after_ms <= 60_000);
    }

    #[test]
    fn limiter_window_resets() {
        let l = limiter(1, 1_000);
        let now = Utc::now();
        assert!(l.check_at("s", now).allowed);
        assert!(!l.check_at("s", now + Duration::milliseconds(500)).allowed);
        assert!(l.check_at("s", now + Duration::milliseconds(1_000)).allowed);
    }

    #[test]
    fn limiter_sessions_are_independent() {
        let l = limiter(1, 60_000);
        let now = Utc::now();
        assert!(l.check_at("s1", now).allowed);
        assert!(l.check_at("s2", now).allowed);
        assert!(!l.check_at("s1", now).allowed);
    }
}
