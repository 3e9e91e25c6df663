// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Events emitted by the agentic loop for telemetry consumers.
///
/// The loop never blocks on these: delivery is best-effort via a bounded
/// channel and the loop runs to completion whether or not anyone listens.
#[derive(Debug, Clone)]
pub enum LoopEvent {
    /// A model turn is about to start.
    TurnStart { iteration: u32 },
    /// The model produced an assistant message.
    MessageStart,
    /// A tool execution batch member started.
    ToolExecutionStart { call_id: String, tool: String },
    /// A tool execution finished.
    ToolExecutionEnd {
        call_id: String,
        tool: String,
        success: bool,
    },
    /// The loop finished (final message, cap, timeout, or error).
    TurnComplete,
}
