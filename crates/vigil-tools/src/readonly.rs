// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Read-only classification of tool calls.
//!
//! The agent loop runs read-only calls concurrently and without approval;
//! everything else is treated as mutating.  Classification is derived from
//! the tool + action pair so tools with mixed surfaces (text_editor,
//! browser, computer) are split per action.

use serde_json::Value;

/// Tools whose every action is read-only.
const ALWAYS_READONLY: &[&str] = &["web_search", "web_fetch", "pdf", "memory", "look"];

const TEXT_EDITOR_READONLY_ACTIONS: &[&str] = &["read", "list", "info", "grep"];

const BROWSER_READONLY_ACTIONS: &[&str] = &[
    "tabs", "read", "elements", "screenshot", "snapshot", "status", "console",
];

const COMPUTER_READONLY_ACTIONS: &[&str] = &[
    "list_windows",
    "get_elements",
    "mouse_position",
    "screen_size",
    "screenshot",
];

/// Whether a call to `tool` with `args` is free of side effects.
///
/// Everything not positively identified as read-only — including `bash`,
/// file writes, clicks, typing, and navigation — is mutating.
pub fn call_is_readonly(tool: &str, args: &Value) -> bool {
    if ALWAYS_READONLY.contains(&tool) {
        return true;
    }
    let action = args.get("action").and_then(|a| a.as_str()).unwrap_or("");
    match tool {
        "text_editor" => TEXT_EDITOR_READONLY_ACTIONS.contains(&action),
        "browser" => {
            BROWSER_READONLY_ACTIONS.contains(&action) || action.starts_with("wait_")
        }
        "computer" => {
            COMPUTER_READONLY_ACTIONS.contains(&action)
                || action.starts_with("read_")
                || action.starts_with("process_")
        }
        _ => false,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
