// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolCall, ToolResult};

/// Maximum characters returned by a single read.
const READ_CAP_CHARS: usize = 100_000;

/// File inspection and editing behind one action-dispatched tool.
///
/// Read-side actions (`read`, `list`, `info`, `grep`) are classified
/// read-only; `write` and `edit` are mutating.
#[derive(Default)]
pub struct TextEditorTool;

#[async_trait]
impl Tool for TextEditorTool {
    fn name(&self) -> &str {
        "text_editor"
    }

    fn description(&self) -> &str {
        "File operations dispatched by 'action':\n\
         - read: return file content (optional 'offset'/'limit' line window)\n\
         - write: create or overwrite a file with 'content'\n\
         - edit: replace the first occurrence of 'old' with 'new'\n\
         - list: list a directory\n\
         - grep: search 'pattern' (regex) in a file or directory\n\
         - info: size, line count, and modification time"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["read", "write", "edit", "list", "grep", "info"]
                },
                "path": { "type": "string", "description": "File or directory path" },
                "content": { "type": "string", "description": "Content for write" },
                "old": { "type": "string", "description": "Text to replace (edit)" },
                "new": { "type": "string", "description": "Replacement text (edit)" },
                "pattern": { "type": "string", "description": "Regex for grep" },
                "offset": { "type": "integer", "description": "First line for read (1-based)" },
                "limit": { "type": "integer", "description": "Max lines for read" }
            },
            "required": ["action", "path"]
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolResult {
        let action = call
            .arguments
            .get("action")
            .and_then(|a| a.as_str())
            .unwrap_or("");
        let Some(path) = call.arguments.get("path").and_then(|p| p.as_str()) else {
            return ToolResult::err("missing 'path' parameter");
        };
        match action {
            "read" => read(path, &call.arguments),
            "write" => write(path, &call.arguments),
            "edit" => edit(path, &call.arguments),
            "list" => list(path),
            "grep" => grep(path, &call.arguments),
            "info" => info(path),
            other => ToolResult::err(format!("unknown action: {other}")),
        }
    }
}

fn read(path: &str, args: &Value) -> ToolResult {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => return ToolResult::err(format!("cannot read {path}: {e}")),
    };
    let total_lines = text.lines().count();
    let offset = args.get("offset").and_then(|o| o.as_u64()).unwrap_or(1) as usize;
    let limit = args.get("limit").and_then(|l| l.as_u64()).map(|l| l as usize);

    let content: String = match limit {
        Some(limit) => text
            .lines()
            .skip(offset.saturating_sub(1))
            .take(limit)
            .collect::<Vec<_>>()
            .join("\n"),
        None if offset > 1 => text
            .lines()
            .skip(offset - 1)
            .collect::<Vec<_>>()
            .join("\n"),
        None => text,
    };
    let mut content = content;
    if content.len() > READ_CAP_CHARS {
        content.truncate(READ_CAP_CHARS);
        content.push_str("\n[truncated; re-read with offset/limit]");
    }
    ToolResult::ok(content).with_extra("total_lines", json!(total_lines))
}

fn write(path: &str, args: &Value) -> ToolResult {
    let Some(content) = args.get("content").and_then(|c| c.as_str()) else {
        return ToolResult::err("missing 'content' parameter");
    };
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return ToolResult::err(format!("cannot create {}: {e}", parent.display()));
            }
        }
    }
    match std::fs::write(path, content) {
        Ok(()) => ToolResult::ok(format!("wrote {} bytes to {path}", content.len())),
        Err(e) => ToolResult::err(format!("cannot write {path}: {e}")),
    }
}

fn edit(path: &str, args: &Value) -> ToolResult {
    let (Some(old), Some(new)) = (
        args.get("old").and_then(|o| o.as_str()),
        args.get("new").and_then(|n| n.as_str()),
    ) else {
        return ToolResult::err("edit requires 'old' and 'new' parameters");
    };
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => return ToolResult::err(format!("cannot read {path}: {e}")),
    };
    if !text.contains(old) {
        return ToolResult::err(format!("'old' text not found in {path}"));
    }
    let updated = text.replacen(old, new, 1);
    match std::fs::write(path, updated) {
        Ok(()) => ToolResult::ok(format!("edited {path}")),
        Err(e) => ToolResult::err(format!("cannot write {path}: {e}")),
    }
}

fn list(path: &str) -> ToolResult {
    let entries = match std::fs::read_dir(path) {
        Ok(e) => e,
        Err(e) => return ToolResult::err(format!("cannot list {path}: {e}")),
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| {
            let mut name = e.file_name().to_string_lossy().to_string();
            if e.path().is_dir() {
                name.push('/');
            }
            name
        })
        .collect();
    names.sort();
    let count = names.len();
    ToolResult::ok(names.join("\n")).with_extra("entry_count", json!(count))
}

fn grep(path: &str, args: &Value) -> ToolResult {
    let Some(pattern) = args.get("pattern").and_then(|p| p.as_str()) else {
        return ToolResult::err("missing 'pattern' parameter");
    };
    let re = match regex::Regex::new(pattern) {
        Ok(r) => r,
        Err(e) => return ToolResult::err(format!("invalid pattern: {e}")),
    };

    let mut files = Vec::new();
    let root = std::path::Path::new(path);
    if root.is_dir() {
        collect_files(root, &mut files, 0);
    } else {
        files.push(root.to_path_buf());
    }

    let mut matches = Vec::new();
    for file in files {
        let Ok(text) = std::fs::read_to_string(&file) else {
            continue;
        };
        for (i, line) in text.lines().enumerate() {
            if re.is_match(line) {
                matches.push(format!("{}:{}: {}", file.display(), i + 1, line.trim()));
            }
        }
    }
    let total = matches.len();
    ToolResult::ok(matches.join("\n")).with_extra("total_matches", json!(total))
}

fn collect_files(dir: &std::path::Path, out: &mut Vec<std::path::PathBuf>, depth: usize) {
    if depth > 8 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        if path.is_dir() {
            collect_files(&path, out, depth + 1);
        } else {
            out.push(path);
        }
    }
}

fn info(path: &str) -> ToolResult {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) => return ToolResult::err(format!("cannot stat {path}: {e}")),
    };
    let line_count = if meta.is_file() {
        std::fs::read_to_string(path)
            .map(|t| t.lines().count())
            .unwrap_or(0)
    } else {
        0
    };
    ToolResult::ok(format!(
        "{path}: {} bytes, {} lines, {}",
        meta.len(),
        line_count,
        if meta.is_dir() { "directory" } else { "file" }
    ))
    .with_extra("size_bytes", json!(meta.len()))
    .with_extra("total_lines", json!(line_count))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "1".into(),
            name: "text_editor".into(),
            arguments: args,
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt").to_string_lossy().to_string();
        let t = TextEditorTool;

        let w = t
            .execute(&call(json!({"action": "write", "path": path, "content": "line1\nline2\nline3"})))
            .await;
        assert!(w.success(), "{:?}", w.error);

        let r = t.execute(&call(json!({"action": "read", "path": path}))).await;
        assert!(r.success());
        assert_eq!(r.output.unwrap(), "line1\nline2\nline3");
        assert_eq!(r.extra["total_lines"], 3);
    }

    #[tokio::test]
    async fn read_with_offset_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.txt");
        std::fs::write(&path, "a\nb\nc\nd\ne").unwrap();
        let t = TextEditorTool;
        let r = t
            .execute(&call(json!({
                "action": "read",
                "path": path.to_string_lossy(),
                "offset": 2,
                "limit": 2
            })))
            .await;
        assert_eq!(r.output.unwrap(), "b\nc");
    }

    #[tokio::test]
    async fn read_missing_file_is_error() {
        let t = TextEditorTool;
        let r = t
            .execute(&call(json!({"action": "read", "path": "/no/such/file.txt"})))
            .await;
        assert!(!r.success());
    }

    #[tokio::test]
    async fn edit_replaces_first_occurrence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.txt");
        std::fs::write(&path, "foo bar foo").unwrap();
        let t = TextEditorTool;
        let r = t
            .execute(&call(json!({
                "action": "edit",
                "path": path.to_string_lossy(),
                "old": "foo",
                "new": "baz"
            })))
            .await;
        assert!(r.success());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "baz bar foo");
    }

    #[tokio::test]
    async fn edit_missing_old_text_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.txt");
        std::fs::write(&path, "content").unwrap();
        let t = TextEditorTool;
        let r = t
            .execute(&call(json!({
                "action": "edit",
                "path": path.to_string_lossy(),
                "old": "absent",
                "new": "x"
            })))
            .await;
        assert!(!r.success());
        assert!(r.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn list_sorts_and_marks_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("z.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let t = TextEditorTool;
        let r = t
            .execute(&call(json!({"action": "list", "path": dir.path().to_string_lossy()})))
            .await;
        assert_eq!(r.output.unwrap(), "sub/\nz.txt");
        assert_eq!(r.extra["entry_count"], 2);
    }

    #[tokio::test]
    async fn grep_reports_file_line_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e.txt");
        std::fs::write(&path, "alpha\nbeta\nalpha again").unwrap();
        let t = TextEditorTool;
        let r = t
            .execute(&call(json!({
                "action": "grep",
                "path": path.to_string_lossy(),
                "pattern": "alpha"
            })))
            .await;
        assert!(r.success());
        assert_eq!(r.extra["total_matches"], 2);
        let out = r.output.unwrap();
        assert!(out.contains(":1: alpha"));
        assert!(out.contains(":3: alpha again"));
    }

    #[tokio::test]
    async fn grep_invalid_regex_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "x").unwrap();
        let t = TextEditorTool;
        let r = t
            .execute(&call(json!({
                "action": "grep",
                "path": path.to_string_lossy(),
                "pattern": "("
            })))
            .await;
        assert!(!r.success());
    }

    #[tokio::test]
    async fn info_reports_size_and_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.txt");
        std::fs::write(&path, "a\nb").unwrap();
        let t = TextEditorTool;
        let r = t
            .execute(&call(json!({"action": "info", "path": path.to_string_lossy()})))
            .await;
        assert!(r.success());
        assert_eq!(r.extra["total_lines"], 2);
        assert_eq!(r.extra["size_bytes"], 3);
    }

    #[tokio::test]
    async fn unknown_action_is_error() {
        let t = TextEditorTool;
        let r = t
            .execute(&call(json!({"action": "transmogrify", "path": "/tmp/x"})))
            .await;
        assert!(!r.success());
    }

    #[test]
    fn read_actions_are_readonly_write_actions_are_not() {
        let t = TextEditorTool;
        assert!(t.is_readonly(&json!({"action": "read"})));
        assert!(t.is_readonly(&json!({"action": "grep"})));
        assert!(!t.is_readonly(&json!({"action": "write"})));
        assert!(!t.is_readonly(&json!({"action": "edit"})));
    }
}
