// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Infra store: rate-limit counters, idempotency records, event log.
//!
//! Single-process, in-memory state behind one mutex per table.  The rest of
//! the system depends only on the semantics here: fixed-window rate limits,
//! hash-checked idempotency with TTL, and a monotonically-numbered event log
//! with per-device ACK watermarks and a per-device retention cap.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Rate limiting ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct WindowCounter {
    window_start: DateTime<Utc>,
    window_ms: u64,
    count: u32,
}

// ─── Idempotency ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub request_hash: String,
    pub response: String,
    pub expires_at: DateTime<Utc>,
}

// ─── Events ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub time: DateTime<Utc>,
    pub status: String,
    pub source: String,
    pub message: String,
    #[serde(default)]
    pub metadata: Value,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PollResult {
    pub cursor: Option<u64>,
    pub events: Vec<Event>,
    pub dropped: usize,
}

#[derive(Default)]
struct EventLog {
    next_id: u64,
    events: Vec<Event>,
    /// device id → highest acknowledged event id
    acks: HashMap<String, u64>,
}

// ─── Store ────────────────────────────────────────────────────────────────────

pub struct InfraStore {
    rate: Mutex<HashMap<String, WindowCounter>>,
    idempotency: Mutex<HashMap<String, IdempotencyRecord>>,
    events: Mutex<EventLog>,
}

impl InfraStore {
    pub fn new() -> Self {
        Self {
            rate: Mutex::new(HashMap::new()),
            idempotency: Mutex::new(HashMap::new()),
            events: Mutex::new(EventLog {
                next_id: 1,
                ..EventLog::default()
            }),
        }
    }

    // ── Rate limit ────────────────────────────────────────────────────────────

    /// Fixed-window counter: the `max`-th request in a window succeeds, the
    /// `(max+1)`-th is rejected with `reset_at` in the future.
    pub fn check_rate_limit(
        &self,
        bucket: &str,
        window_ms: u64,
        max: u32,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let mut rate = self.rate.lock().expect("rate lock");
        let counter = rate.entry(bucket.to_string()).or_insert(WindowCounter {
            window_start: now,
            window_ms,
            count: 0,
        });
        let window = Duration::milliseconds(window_ms as i64);
        if now >= counter.window_start + window {
            counter.window_start = now;
            counter.window_ms = window_ms;
            counter.count = 0;
        }
        let reset_at = counter.window_start + window;
        if counter.count >= max {
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at,
            };
        }
        counter.count += 1;
        RateLimitDecision {
            allowed: true,
            remaining: max - counter.count,
            reset_at,
        }
    }

    // ── Idempotency ───────────────────────────────────────────────────────────

    pub fn get_idempotency(&self, key: &str, now: DateTime<Utc>) -> Option<IdempotencyRecord> {
        let map = self.idempotency.lock().expect("idempotency lock");
        map.get(key).filter(|r| r.expires_at > now).cloned()
    }

    /// Save a record.  Overwrite is allowed when the key is expired or the
    /// request hash matches; a live record with a different hash stays.
    pub fn save_idempotency(
        &self,
        key: &str,
        request_hash: &str,
        response: &str,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut map = self.idempotency.lock().expect("idempotency lock");
        if let Some(existing) = map.get(key) {
            if existing.expires_at > Utc::now() && existing.request_hash != request_hash {
                anyhow::bail!("idempotency key reused with a different request hash");
            }
        }
        map.insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                request_hash: request_hash.to_string(),
                response: response.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    // ── Events ────────────────────────────────────────────────────────────────

    pub fn insert_event(
        &self,
        event_type: &str,
        status: &str,
        source: &str,
        message: &str,
        metadata: Value,
        ttl_ms: u64,
    ) -> u64 {
        let mut log = self.events.lock().expect("event lock");
        let id = log.next_id;
        log.next_id += 1;
        let now = Utc::now();
        log.events.push(Event {
            id,
            event_type: event_type.to_string(),
            time: now,
            status: status.to_string(),
            source: source.to_string(),
            message: message.to_string(),
            metadata,
            expires_at: now + Duration::milliseconds(ttl_ms as i64),
        });
        id
    }

    /// Advance the device's ACK watermark (monotonic: never moves backward).
    pub fn ack_events(&self, device_id: &str, upto_id: u64, _now: DateTime<Utc>) {
        let mut log = self.events.lock().expect("event lock");
        let watermark = log.acks.entry(device_id.to_string()).or_insert(0);
        if upto_id > *watermark {
            *watermark = upto_id;
        }
    }

    /// Events strictly after `since` (or after the device's ACK watermark
    /// when `since` is absent), capped at `limit` returned and `cap` retained
    /// per device; older unreturned events beyond the cap count as dropped.
    pub fn poll_events_for_device(
        &self,
        device_id: &str,
        since: Option<u64>,
        limit: usize,
        cap: usize,
        now: DateTime<Utc>,
    ) -> PollResult {
        let log = self.events.lock().expect("event lock");
        let watermark = log.acks.get(device_id).copied().unwrap_or(0);
        let effective_since = since.unwrap_or(watermark);

        let candidates: Vec<&Event> = log
            .events
            .iter()
            .filter(|e| e.id > effective_since && e.expires_at > now)
            .collect();
        let dropped = candidates.len().saturating_sub(cap);
        let capped = &candidates[dropped..];
        let events: Vec<Event> = capped.iter().take(limit).map(|e| (*e).clone()).collect();
        let cursor = events.last().map(|e| e.id);
        PollResult {
            cursor,
            events,
            dropped,
        }
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().expect("event lock").events.len()
    }

    // ── Cleanup ───────────────────────────────────────────────────────────────

    /// Drop expired rows; called opportunistically at request entry.
    pub fn cleanup(&self, now: DateTime<Utc>) {
        self.idempotency
            .lock()
            .expect("idempotency lock")
            .retain(|_, r| r.expires_at > now);
        self.events
            .lock()
            .expect("event lock")
            .events
            .retain(|e| e.expires_at > now);
        self.rate.lock().expect("rate lock").retain(|_, c| {
            now < c.window_start + Duration::milliseconds(2 * c.window_ms as i64)
        });
    }
}

impl Default for InfraStore {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
