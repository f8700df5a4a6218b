// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use crate::tool::{Tool, ToolCall, ToolResult, ToolSchema};

/// Number of executions retained in the in-memory history ring.
const HISTORY_CAPACITY: usize = 200;

/// One recorded tool execution.
#[derive(Debug, Clone, Serialize)]
pub struct ToolExecution {
    pub tool: String,
    pub args: Value,
    /// Compact result text (output or error, whichever is present).
    pub result: String,
    pub success: bool,
    pub duration_ms: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Central registry holding all available tools plus the execution history
/// ring used for telemetry and lesson extraction.
///
/// Tools are immutable after registration; all methods take `&self`, so a
/// registry behind an `Arc` is shared freely across sessions and parallel
/// executions.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    history: Mutex<VecDeque<ToolExecution>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Schemas for all registered tools, sorted by name for a stable prompt
    /// prefix.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.input_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Whether a call is read-only, consulting the owning tool when
    /// registered and the shared action table otherwise.
    pub fn is_readonly(&self, call: &ToolCall) -> bool {
        match self.tools.get(&call.name) {
            Some(tool) => tool.is_readonly(&call.arguments),
            None => crate::readonly::call_is_readonly(&call.name, &call.arguments),
        }
    }

    /// Whether the named tool demands the approval gate regardless of mode.
    pub fn requires_approval(&self, name: &str) -> bool {
        self.tools
            .get(name)
            .map(|t| t.requires_approval())
            .unwrap_or(false)
    }

    /// Execute a call and record it in the history ring.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let started = Instant::now();
        let result = match self.tools.get(&call.name) {
            Some(tool) => tool.execute(call).await,
            None => ToolResult::err(format!("unknown tool: {}", call.name)),
        };
        self.record(call, &result, started.elapsed().as_millis() as u64);
        result
    }

    fn record(&self, call: &ToolCall, result: &ToolResult, duration_ms: u64) {
        let text = result
            .output
            .as_deref()
            .or(result.error.as_deref())
            .unwrap_or_default();
        let entry = ToolExecution {
            tool: call.name.clone(),
            args: call.arguments.clone(),
            result: text.chars().take(500).collect(),
            success: result.success(),
            duration_ms,
            timestamp: chrono::Utc::now(),
        };
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        if history.len() >= HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(entry);
    }

    /// The most recent `n` executions, oldest first.
    pub fn history(&self, n: usize) -> Vec<ToolExecution> {
        let history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        let skip = history.len().saturating_sub(n);
        history.iter().skip(skip).cloned().collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
