// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Reply router shared across channels.
//!
//! A pending write-gate confirmation registers a waiter for `(channel,
//! chat_id, from_user_id)`.  Incoming messages are offered to the router
//! first; a consumed message resolves its waiter and is **not** forwarded to
//! the gateway pipeline.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::InboundMessage;

struct Waiter {
    id: Uuid,
    channel: String,
    chat_id: String,
    from_user_id: String,
    tx: oneshot::Sender<String>,
}

#[derive(Default)]
struct Inner {
    waiters: Vec<Waiter>,
}

/// Dispatches incoming messages to pending confirmation waiters.
#[derive(Clone, Default)]
pub struct ReplyRouter {
    inner: Arc<Mutex<Inner>>,
}

/// Removes its waiter on drop so an abandoned gate never leaks.
pub struct WaiterGuard {
    id: Uuid,
    router: ReplyRouter,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.router.remove(self.id);
    }
}

impl ReplyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for the next message from `from_user_id` in
    /// `(channel, chat_id)`.  The receiver resolves with the reply body.
    pub fn register(
        &self,
        channel: &str,
        chat_id: &str,
        from_user_id: &str,
    ) -> (WaiterGuard, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        self.inner.lock().expect("router lock").waiters.push(Waiter {
            id,
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            from_user_id: from_user_id.to_string(),
            tx,
        });
        (
            WaiterGuard {
                id,
                router: self.clone(),
            },
            rx,
        )
    }

    /// Offer a message to pending waiters.  Returns `true` when consumed.
    pub fn dispatch(&self, msg: &InboundMessage) -> bool {
        let mut inner = self.inner.lock().expect("router lock");
        let Some(pos) = inner.waiters.iter().position(|w| {
            w.channel == msg.channel && w.chat_id == msg.chat_id && w.from_user_id == msg.from
        }) else {
            return false;
        };
        let waiter = inner.waiters.remove(pos);
        debug!(channel = %msg.channel, chat = %msg.chat_id, "reply consumed by pending waiter");
        // A dropped receiver just means the gate gave up first.
        let _ = waiter.tx.send(msg.body.clone());
        true
    }

    fn remove(&self, id: Uuid) {
        self.inner
            .lock()
            .expect("router lock")
            .waiters
            .retain(|w| w.id != id);
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().expect("router lock").waiters.len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
