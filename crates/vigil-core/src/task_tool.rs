// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use vigil_tools::{Tool, ToolCall, ToolResult};

use crate::subagent::SubagentExecutor;

/// Tool that delegates a focused task to a subagent running the full loop
/// against an isolated session.  The subagent's registry deliberately lacks
/// this tool, which bounds nesting at one level.
pub struct TaskTool {
    executor: Arc<SubagentExecutor>,
}

impl TaskTool {
    pub fn new(executor: Arc<SubagentExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "task"
    }

    fn description(&self) -> &str {
        "Spawn a focused sub-agent to complete an isolated task and return its \
         final text output. The sub-agent has its own fresh conversation and \
         the standard tools; the current conversation is unaffected."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Short label for the sub-agent (e.g. 'indexer')"
                },
                "prompt": {
                    "type": "string",
                    "description": "The task description for the sub-agent"
                }
            },
            "required": ["prompt"]
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolResult {
        let Some(prompt) = call.arguments.get("prompt").and_then(|p| p.as_str()) else {
            return ToolResult::err("missing 'prompt' parameter");
        };
        let name = call
            .arguments
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or("worker");

        let result = self.executor.spawn(name, prompt).await;
        if result.success {
            if result.output.is_empty() {
                ToolResult::ok("(sub-agent produced no text output)")
                    .with_extra("session_key", json!(result.session_key))
            } else {
                ToolResult::ok(result.output).with_extra("session_key", json!(result.session_key))
            }
        } else {
            ToolResult::err(format!(
                "sub-agent failed: {}",
                result.error.unwrap_or_else(|| "unknown error".into())
            ))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
