// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! MCP bridge: registers remote MCP-server tools into the local registry.
//!
//! Discovered tools register as `<server>_<clean_name>`; invocation goes
//! through an injected [`McpTransport`] so the registry stays synchronous
//! from the caller's view while the transport does async/remote work.
//! Input schemas are cleaned to the JSON-Schema subset the providers accept.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use vigil_model::sanitize::clean_tool_schema;

use crate::registry::ToolRegistry;
use crate::tool::{Tool, ToolCall, ToolResult};

/// Per-server registration cap.
const MAX_TOOLS_PER_SERVER: usize = 50;

/// One tool as discovered from an MCP server.
#[derive(Debug, Clone)]
pub struct McpToolInfo {
    pub server: String,
    pub raw_name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Remote invocation seam.  Implementations own the wire protocol and any
/// connection pooling; the bridge only routes calls.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn call_tool(&self, server: &str, raw_name: &str, args: Value)
        -> anyhow::Result<Value>;
}

/// Normalise a raw MCP tool name: strip the common `API-` / verb prefixes,
/// map hyphens to underscores, lowercase.
pub fn clean_tool_name(raw: &str) -> String {
    let mut name = raw.to_string();
    for prefix in ["API-", "api-"] {
        if let Some(rest) = name.strip_prefix(prefix) {
            name = rest.to_string();
            break;
        }
    }
    for verb in ["get-", "fetch-", "retrieve-"] {
        if let Some(rest) = name.strip_prefix(verb) {
            if !rest.is_empty() {
                name = rest.to_string();
            }
            break;
        }
    }
    name.to_lowercase().replace('-', "_")
}

/// Register up to [`MAX_TOOLS_PER_SERVER`] tools from one server, returning
/// the registered names in order.  Name collisions fall back to the full
/// raw name as suffix; a second collision skips the tool.
pub fn register_server(
    registry: &mut ToolRegistry,
    tools: Vec<McpToolInfo>,
    transport: Arc<dyn McpTransport>,
) -> Vec<String> {
    let mut registered = Vec::new();
    for info in tools.into_iter().take(MAX_TOOLS_PER_SERVER) {
        let clean = clean_tool_name(&info.raw_name);
        let mut name = format!("{}_{}", info.server, clean);
        if registry.get(&name).is_some() {
            let full = info.raw_name.to_lowercase().replace('-', "_");
            name = format!("{}_{}", info.server, full);
            if registry.get(&name).is_some() {
                warn!(server = %info.server, tool = %info.raw_name, "skipping MCP tool: name collision");
                continue;
            }
        }
        debug!(server = %info.server, raw = %info.raw_name, as_name = %name, "registering MCP tool");
        registry.register(McpTool {
            registered_name: name.clone(),
            server: info.server,
            raw_name: info.raw_name,
            description: info.description,
            schema: clean_tool_schema(&info.input_schema),
            transport: Arc::clone(&transport),
        });
        registered.push(name);
    }
    registered
}

struct McpTool {
    registered_name: String,
    server: String,
    raw_name: String,
    description: String,
    schema: Value,
    transport: Arc<dyn McpTransport>,
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.registered_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, call: &ToolCall) -> ToolResult {
        match self
            .transport
            .call_tool(&self.server, &self.raw_name, call.arguments.clone())
            .await
        {
            Ok(result) => ToolResult::ok(render_mcp_result(&result)),
            Err(e) => ToolResult::err(format!("MCP call failed: {e:#}")),
        }
    }
}

/// MCP results are either a `{content: [{type: "text", text}]}` envelope or
/// arbitrary JSON; extract the text blocks when present.
fn render_mcp_result(result: &Value) -> String {
    if let Some(content) = result.get("content").and_then(|c| c.as_array()) {
        let texts: Vec<&str> = content
            .iter()
            .filter(|b| b["type"].as_str() == Some("text"))
            .filter_map(|b| b["text"].as_str())
            .collect();
        if !texts.is_empty() {
            return texts.join("\n");
        }
    }
    match result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
