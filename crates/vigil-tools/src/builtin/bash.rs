// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolResult};

/// Hard byte ceiling for combined stdout + stderr kept in the result.
const OUTPUT_LIMIT_BYTES: usize = 20_000;
const HEAD_LINES: usize = 100;
const TAIL_LINES: usize = 100;

/// Built-in tool that runs a shell command.
pub struct BashTool {
    pub timeout_secs: u64,
}

impl Default for BashTool {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout + stderr with the exit code.\n\
         'command' is required and can be any bash one-liner.\n\
         Output is capped at ~20 KB; when larger, the first 100 and last 100 lines\n\
         are preserved with an omission marker in the middle.\n\
         Prefer non-interactive commands; avoid anything that requires a TTY."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The complete bash one-liner to execute."
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory (optional, defaults to cwd)"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Execution timeout in seconds (optional)"
                }
            },
            "required": ["command"]
        })
    }

    fn is_readonly(&self, _args: &Value) -> bool {
        // Shell commands mutate until the approval layer proves otherwise.
        false
    }

    fn requires_approval(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall) -> ToolResult {
        let command = match call.arguments.get("command").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return ToolResult::err("missing 'command' parameter"),
        };
        let workdir = call
            .arguments
            .get("workdir")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let timeout = call
            .arguments
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.timeout_secs);

        debug!(cmd = %command, "executing bash tool");

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&command);
        // Detach the subprocess from any controlling terminal: stdin from
        // /dev/null, SIGKILL on timeout-drop, and a fresh session on unix so
        // the child cannot open /dev/tty.
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        if let Some(wd) = &workdir {
            cmd.current_dir(wd);
        }

        let result =
            tokio::time::timeout(std::time::Duration::from_secs(timeout), cmd.output()).await;

        match result {
            Ok(Ok(output)) => {
                let mut content = String::new();
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stdout.is_empty() {
                    content.push_str(&head_tail_truncate(&stdout));
                }
                if !stderr.is_empty() {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str("[stderr]\n");
                    content.push_str(&head_tail_truncate(&stderr));
                }
                let code = output.status.code().unwrap_or(-1);
                if code == 0 || code == 1 {
                    // Exit 1 is the Unix convention for "no matches" /
                    // "condition false"; flagging it as an error inflates
                    // failure counters and confuses the model.
                    ToolResult::ok(content).with_extra("exit_code", json!(code))
                } else {
                    ToolResult::err(format!("[exit {code}]\n{content}"))
                        .with_extra("exit_code", json!(code))
                }
            }
            Ok(Err(e)) => ToolResult::err(format!("spawn error: {e}")),
            Err(_) => ToolResult::err(format!("timeout after {timeout}s")),
        }
    }
}

/// Keep the first and last lines of oversized output with an omission marker
/// in the middle, so command headers AND trailing errors both survive.
pub(crate) fn head_tail_truncate(s: &str) -> String {
    if s.len() <= OUTPUT_LIMIT_BYTES {
        return s.to_string();
    }

    let lines: Vec<&str> = s.lines().collect();
    let total = lines.len();

    if total <= HEAD_LINES + TAIL_LINES {
        // Very long lines: fall back to byte-level head + tail windows.
        let tail_start = s.len().saturating_sub(OUTPUT_LIMIT_BYTES / 2);
        let tail_str = &s[floor_char_boundary(s, tail_start)..];
        let head_end = floor_char_boundary(s, OUTPUT_LIMIT_BYTES / 2);
        let head_str = &s[..head_end];
        let omitted = s.len() - head_str.len() - tail_str.len();
        return format!("{head_str}\n...[{omitted} bytes omitted]...\n{tail_str}");
    }

    let head = lines[..HEAD_LINES].join("\n");
    let tail = lines[total - TAIL_LINES..].join("\n");
    let omitted_lines = total - HEAD_LINES - TAIL_LINES;
    let omitted_bytes = s.len().saturating_sub(head.len() + tail.len());
    format!("{head}\n...[{omitted_lines} lines / ~{omitted_bytes} bytes omitted]...\n{tail}")
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
