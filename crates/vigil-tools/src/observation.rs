// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Observation shaping: condense a tool result into bounded text suitable
//! for injection back into the conversation as a tool-role message.
//!
//! Per-tool rules keep the most useful portion of each output shape —
//! command output keeps its exit code, grep keeps leading matches, element
//! lists keep a prefix with key attributes.  The generic fallback walks the
//! result's top-level fields under a hard total cap so no tool can flood
//! the context.

use serde_json::Value;

use crate::tool::{ToolResult, ToolStatus};

const BASH_OUTPUT_CAP: usize = 1000;
const FILE_CONTENT_CAP: usize = 4000;
const PAGE_CONTENT_CAP: usize = 2000;
const GREP_MATCH_LIMIT: usize = 20;
const LIST_ITEM_LIMIT: usize = 40;
const ERROR_CAP: usize = 200;
const GENERIC_VALUE_CAP: usize = 2000;
const GENERIC_TOTAL_CAP: usize = 8000;

/// Produce the observation string for one tool result.
pub fn shape_observation(tool: &str, args: &Value, result: &ToolResult) -> String {
    match result.status {
        ToolStatus::Denied => {
            let reason = result.error.as_deref().unwrap_or("denied by policy");
            return format!("status=denied: {}", truncate(reason, ERROR_CAP));
        }
        ToolStatus::PendingApproval => {
            return "status=pending_approval: awaiting user decision".into();
        }
        ToolStatus::Error => {
            let msg = result.error.as_deref().unwrap_or("unknown error");
            return format!("Error: {}", truncate(msg, ERROR_CAP));
        }
        ToolStatus::Success => {}
    }

    let action = args.get("action").and_then(|a| a.as_str()).unwrap_or("");
    match (tool, action) {
        ("bash", _) => shape_bash(result),
        ("text_editor", "read") => shape_file_read(args, result),
        ("text_editor", "grep") => shape_grep(result),
        ("browser", "read") => shape_page_read(result),
        ("browser", "elements") | ("computer", "get_elements") | ("computer", "list_windows") => {
            shape_list(result)
        }
        _ => shape_generic(result),
    }
}

fn shape_bash(result: &ToolResult) -> String {
    let output = result.output.as_deref().unwrap_or("");
    let exit_code = result.extra.get("exit_code").and_then(|c| c.as_i64()).unwrap_or(0);
    format!(
        "Output:\n{}\nExit code: {exit_code}",
        truncate(output, BASH_OUTPUT_CAP)
    )
}

fn shape_file_read(args: &Value, result: &ToolResult) -> String {
    let path = args.get("path").and_then(|p| p.as_str()).unwrap_or("?");
    let total_lines = result
        .extra
        .get("total_lines")
        .and_then(|l| l.as_u64())
        .unwrap_or(0);
    let content = result.output.as_deref().unwrap_or("");
    format!(
        "{path} ({total_lines} lines)\n{}",
        truncate(content, FILE_CONTENT_CAP)
    )
}

fn shape_grep(result: &ToolResult) -> String {
    let matches: Vec<&str> = result
        .output
        .as_deref()
        .unwrap_or("")
        .lines()
        .filter(|l| !l.is_empty())
        .collect();
    let total = result
        .extra
        .get("total_matches")
        .and_then(|m| m.as_u64())
        .unwrap_or(matches.len() as u64);
    let shown: Vec<&str> = matches.iter().take(GREP_MATCH_LIMIT).copied().collect();
    let mut out = format!("{total} matches\n{}", shown.join("\n"));
    if matches.len() > GREP_MATCH_LIMIT {
        out.push_str(&format!("\n... +{} more", matches.len() - GREP_MATCH_LIMIT));
    }
    out
}

fn shape_page_read(result: &ToolResult) -> String {
    let title = result.extra.get("title").and_then(|t| t.as_str()).unwrap_or("");
    let url = result.extra.get("url").and_then(|u| u.as_str()).unwrap_or("");
    let content = result.output.as_deref().unwrap_or("");
    format!("{title}\n{url}\n{}", truncate(content, PAGE_CONTENT_CAP))
}

/// Element / window lists: count prefix, first items with key attributes,
/// tail truncation notice.
fn shape_list(result: &ToolResult) -> String {
    let items: Vec<Value> = result
        .extra
        .get("items")
        .and_then(|i| i.as_array())
        .cloned()
        .unwrap_or_default();
    if items.is_empty() {
        return result.output.clone().unwrap_or_else(|| "0 items".into());
    }
    let mut lines = vec![format!("{} items", items.len())];
    for item in items.iter().take(LIST_ITEM_LIMIT) {
        let mut attrs = Vec::new();
        for key in ["name", "role", "automation_id", "title", "tag"] {
            if let Some(v) = item.get(key).and_then(|v| v.as_str()) {
                if !v.is_empty() {
                    attrs.push(format!("{key}={v}"));
                }
            }
        }
        if attrs.is_empty() {
            attrs.push(truncate(&item.to_string(), 120));
        }
        lines.push(format!("- {}", attrs.join(" ")));
    }
    if items.len() > LIST_ITEM_LIMIT {
        lines.push(format!("... +{} more", items.len() - LIST_ITEM_LIMIT));
    }
    lines.join("\n")
}

/// Generic fallback: the output text plus every top-level extra field,
/// each value capped, the whole capped harder.
fn shape_generic(result: &ToolResult) -> String {
    let mut out = String::new();
    if let Some(text) = result.output.as_deref() {
        out.push_str(&truncate(text, GENERIC_VALUE_CAP));
    }
    if let Some(map) = result.extra.as_object() {
        for (key, value) in map {
            if out.len() >= GENERIC_TOTAL_CAP {
                out.push_str("\n[...output truncated]");
                return out;
            }
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("{key}: {}", truncate(&rendered, GENERIC_VALUE_CAP)));
        }
    }
    if out.len() > GENERIC_TOTAL_CAP {
        out.truncate(GENERIC_TOTAL_CAP);
        out.push_str("\n[...output truncated]");
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
