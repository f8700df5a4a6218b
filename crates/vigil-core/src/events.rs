// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use vigil_model::ToolCall;

/// Events emitted by the agent loop through its output sink.
///
/// The sink is an explicit parameter of every run: interactive front-ends
/// render these live, while the circuits runner consumes them quietly and
/// forwards only substantive final text.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A new loop round began.
    RoundStarted { round: u32 },
    /// A complete thinking/reasoning block from the model.
    Thinking(String),
    /// The final text of an assistant turn.
    TextComplete(String),
    /// The model requested a tool call.
    ToolCallStarted(ToolCall),
    /// A tool call finished; `observation` is the shaped text injected back
    /// into the conversation.
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        observation: String,
        success: bool,
    },
    /// Context was compacted.
    ContextCompacted {
        tokens_before: usize,
        tokens_after: usize,
    },
    /// A mutating tool call is waiting on an out-of-band approval decision.
    PendingApproval {
        request_id: String,
        tool_name: String,
        command: String,
    },
    /// The run was interrupted; references the last attempted tool.
    Interrupted { last_tool: Option<String> },
    /// The run finished.
    TurnComplete,
    /// A recoverable error note (also fed back to the model).
    Error(String),
}
