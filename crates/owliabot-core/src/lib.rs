// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod events;
mod session;
mod transcript;

pub use agent::{run_agentic_loop, LoopDeps, LoopOptions, LoopOutcome};
pub use events::LoopEvent;
pub use session::{ChatType, Session, SessionKey, SessionMeta, SessionStore};
pub use transcript::TranscriptStore;
