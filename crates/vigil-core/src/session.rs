// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use vigil_model::{Message, ToolCall};

/// One executed tool call as remembered by the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolHistoryEntry {
    pub tool: String,
    pub args: Value,
    /// Compact result text (the shaped observation, truncated).
    pub result: String,
    pub success: bool,
    pub auto_executed: bool,
}

/// A tool call waiting on an out-of-band approval decision, plus the rest
/// of its round.  The loop resumes from exactly this point.
#[derive(Debug, Clone)]
pub struct PendingGate {
    pub request_id: String,
    pub call: ToolCall,
    pub remaining: Vec<ToolCall>,
}

/// An isolated conversation context.
///
/// Messages and tool history are mutated only by the agent loop that owns
/// the session for the duration of a run; the message list is append-only.
/// The interrupt flag is shared: an incoming handler sets it from another
/// thread and the loop observes it at its check points.
pub struct Session {
    pub key: String,
    pub messages: Vec<Message>,
    pub tool_history: Vec<ToolHistoryEntry>,
    pub current_task: Option<String>,
    pub round_count: u32,
    pub pending_gate: Option<PendingGate>,
    interrupt: Arc<AtomicBool>,
}

impl Session {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            messages: Vec::new(),
            tool_history: Vec::new(),
            current_task: None,
            round_count: 0,
            pending_gate: None,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Approximate token count of the whole message list.
    pub fn token_estimate(&self) -> usize {
        self.messages.iter().map(|m| m.approx_tokens()).sum()
    }

    /// Shared handle for setting the interrupt from another thread.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    pub fn clear_interrupt(&self) {
        self.interrupt.store(false, Ordering::SeqCst);
    }

    /// The name of the most recently attempted tool, for interrupt
    /// acknowledgements.
    pub fn last_tool(&self) -> Option<&str> {
        self.tool_history.last().map(|e| e.tool.as_str())
    }
}

/// Process-wide session map.  The "main" session always exists; isolated
/// sessions (subagents) get unique keys and a fresh context.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Session>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        let mut map = HashMap::new();
        map.insert(
            "main".to_string(),
            Arc::new(tokio::sync::Mutex::new(Session::new("main"))),
        );
        Self {
            sessions: Mutex::new(map),
        }
    }

    pub fn get_or_create(&self, key: &str) -> Arc<tokio::sync::Mutex<Session>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Session::new(key))))
            .clone()
    }

    /// Create a fresh isolated session with a unique key.
    pub fn create_isolated(&self, prefix: &str) -> (String, Arc<tokio::sync::Mutex<Session>>) {
        let key = format!("{prefix}-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        let session = Arc::new(tokio::sync::Mutex::new(Session::new(key.clone())));
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.insert(key.clone(), Arc::clone(&session));
        (key, session)
    }

    pub fn remove(&self, key: &str) {
        if key == "main" {
            return;
        }
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.remove(key);
    }

    pub fn keys(&self) -> Vec<String> {
        let sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        let mut keys: Vec<String> = sessions.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
