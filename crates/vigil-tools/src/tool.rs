// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use vigil_model::{ToolCall, ToolSchema};

/// Outcome class of one tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
    Denied,
    PendingApproval,
}

/// The result of executing a tool.
///
/// `output` carries the primary text payload; `extra` holds tool-specific
/// structured fields (exit codes, line counts, page titles) that observation
/// shaping reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extra: Value,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Success,
            output: Some(output.into()),
            error: None,
            extra: Value::Null,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            output: None,
            error: Some(message.into()),
            extra: Value::Null,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Denied,
            output: None,
            error: Some(reason.into()),
            extra: Value::Null,
        }
    }

    pub fn pending_approval(request_id: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::PendingApproval,
            output: None,
            error: None,
            extra: serde_json::json!({ "request_id": request_id.into() }),
        }
    }

    /// Attach a structured field for observation shaping.
    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        if !self.extra.is_object() {
            self.extra = Value::Object(Default::default());
        }
        self.extra[key] = value;
        self
    }

    pub fn success(&self) -> bool {
        self.status == ToolStatus::Success
    }
}

/// Trait every built-in and bridged tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the argument object (subset: object root, properties,
    /// required; no $ref/$defs).
    fn input_schema(&self) -> Value;
    /// Whether THIS call is free of side effects.  Tools whose read-only
    /// character depends on an action argument inspect `args`; the default
    /// consults the shared action table.
    fn is_readonly(&self, args: &Value) -> bool {
        crate::readonly::call_is_readonly(self.name(), args)
    }
    /// Whether invocations must pass the approval gate even in auto-execute
    /// mode.
    fn requires_approval(&self) -> bool {
        false
    }
    /// Execute the tool.  Failures are carried in [`ToolResult::err`], never
    /// as an `Err` — the loop feeds errors back to the model as
    /// observations.
    async fn execute(&self, call: &ToolCall) -> ToolResult;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
