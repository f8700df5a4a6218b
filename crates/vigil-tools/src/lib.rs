// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
pub mod mcp;
pub mod observation;
pub mod readonly;
pub mod registry;
pub mod tool;

pub use builtin::bash::BashTool;
pub use builtin::text_editor::TextEditorTool;
pub use builtin::web::{WebFetchTool, WebSearchTool};
pub use mcp::{register_server, McpToolInfo, McpTransport};
pub use observation::shape_observation;
pub use readonly::call_is_readonly;
pub use registry::{ToolExecution, ToolRegistry};
pub use tool::{Tool, ToolCall, ToolResult, ToolSchema, ToolStatus};
