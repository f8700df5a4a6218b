// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use vigil_config::{ApprovalSettings, DefaultPolicy};

use crate::audit::{self, AuditEntry};

/// Outcome of classifying one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalOutcome {
    Approved,
    Denied,
    Pending,
    Timeout,
}

impl std::fmt::Display for ApprovalOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApprovalOutcome::Approved => "approved",
            ApprovalOutcome::Denied => "denied",
            ApprovalOutcome::Pending => "pending",
            ApprovalOutcome::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

/// A classified request to execute a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub id: String,
    pub command: String,
    pub tool_name: String,
    pub session_key: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub result: ApprovalOutcome,
    pub reason: Option<String>,
    /// "auto" | "user" | "allowlist"
    pub approved_by: Option<String>,
}

/// Human-approval hook.  Synchronous: the classification blocks on the
/// answer, which is the suspension point the agent loop expects.
pub trait ApprovalCallback: Send + Sync {
    fn decide(&self, request: &ExecRequest) -> ApprovalOutcome;
}

impl<F> ApprovalCallback for F
where
    F: Fn(&ExecRequest) -> ApprovalOutcome + Send + Sync,
{
    fn decide(&self, request: &ExecRequest) -> ApprovalOutcome {
        self(request)
    }
}

/// Base words (or first-two-token phrases) that auto-approve.
const SAFE_COMMANDS: &[&str] = &[
    // Read-only file operations
    "cat", "head", "tail", "less", "more", "wc", "file", "stat", "ls", "dir", "find", "locate",
    "which", "whereis", "type",
    // Text processing
    "grep", "awk", "sed", "sort", "uniq", "cut", "tr", "diff",
    // System info
    "pwd", "whoami", "hostname", "uname", "date", "cal", "uptime", "ps", "top", "htop", "free",
    "df", "du",
    // Network info
    "ping", "nslookup", "dig", "host", "curl", "wget",
    // Development
    "git status", "git log", "git diff", "git branch", "npm list", "pip list",
    // Echo/print
    "echo", "printf", "print",
];

/// Commands that are always flagged as dangerous.
const DANGEROUS_COMMANDS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "rm -rf ~",
    ":(){ :|:& };:",
    "mkfs",
    "dd if=/dev/zero",
    "dd if=/dev/random",
    "chmod 777 /",
    "chown -r",
    "nc -l",
    "nmap",
    "cat /etc/shadow",
    "cat /etc/passwd",
];

/// Regexes for dangerous operations.
const DANGEROUS_PATTERNS: &[&str] = &[
    r"rm\s+-rf\s+/",
    r">\s*/dev/sd[a-z]",
    r"mkfs\.",
    r"dd\s+if=.*of=/dev",
    r"chmod\s+-R\s+777",
    r"curl.*\|\s*sh",
    r"wget.*\|\s*sh",
    r"eval\s*\(",
    r"exec\s*\(",
];

/// Substrings indicating a command mutates state; their absence is the
/// read-only heuristic.
const WRITE_INDICATORS: &[&str] = &[
    ">", ">>", "rm ", "mv ", "cp ", "mkdir", "rmdir", "touch", "chmod", "chown", "kill", "pkill",
    "apt ", "yum ", "brew ", "pip install", "npm install", "git push", "git commit",
    "git checkout", "sudo",
];

/// Approval statistics over the recent audit log.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalStats {
    pub total_requests: usize,
    pub by_result: HashMap<String, usize>,
    pub by_tool: HashMap<String, usize>,
    pub allowlist_size: usize,
    pub denylist_size: usize,
}

pub struct ApprovalManager {
    settings: ApprovalSettings,
    safe_commands: HashSet<String>,
    dangerous_commands: HashSet<String>,
    dangerous_patterns: Vec<Regex>,
    callback: Mutex<Option<Box<dyn ApprovalCallback>>>,
    log_path: PathBuf,
    // Serialises appends so concurrent classifications never interleave
    // partial lines.
    log_lock: Mutex<()>,
}

impl ApprovalManager {
    pub fn new(settings: ApprovalSettings, data_dir: impl Into<PathBuf>) -> Self {
        let mut safe: HashSet<String> = SAFE_COMMANDS.iter().map(|s| s.to_string()).collect();
        safe.extend(settings.allowlist.iter().map(|s| s.to_lowercase()));
        let mut dangerous: HashSet<String> =
            DANGEROUS_COMMANDS.iter().map(|s| s.to_string()).collect();
        dangerous.extend(settings.denylist.iter().map(|s| s.to_lowercase()));
        let patterns = DANGEROUS_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(&format!("(?i){p}")).ok())
            .collect();
        Self {
            settings,
            safe_commands: safe,
            dangerous_commands: dangerous,
            dangerous_patterns: patterns,
            callback: Mutex::new(None),
            log_path: data_dir.into().join("exec_approvals.jsonl"),
            log_lock: Mutex::new(()),
        }
    }

    /// Register the human-approval hook used when the default policy is
    /// `ask`.
    pub fn set_callback(&self, callback: Box<dyn ApprovalCallback>) {
        *self.callback.lock().unwrap_or_else(|p| p.into_inner()) = Some(callback);
    }

    pub fn log_path(&self) -> &std::path::Path {
        &self.log_path
    }

    /// Classify a command.  Appends exactly one audit line per call.
    pub fn check(&self, command: &str, tool_name: &str, session_key: &str) -> ExecRequest {
        let mut request = ExecRequest {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            command: command.to_string(),
            tool_name: tool_name.to_string(),
            session_key: session_key.to_string(),
            timestamp: chrono::Utc::now(),
            result: ApprovalOutcome::Pending,
            reason: None,
            approved_by: None,
        };

        // Dangerous patterns and the denylist are a risk signal.  The
        // original behavior is log-and-allow; `enforce_dangerous` turns the
        // signal into a hard denial.
        let dangerous = self.is_dangerous(command);
        let denylisted = self.in_denylist(command);
        if dangerous || denylisted {
            let what = if dangerous { "dangerous pattern" } else { "denylist" };
            if self.settings.enforce_dangerous {
                request.result = ApprovalOutcome::Denied;
                request.reason = Some(format!("Matches {what}"));
                warn!(command = %truncate(command, 80), "denied {what} command");
                self.log(&request);
                return request;
            }
            request.reason = Some(format!("Matches {what} (allowed)"));
            warn!(command = %truncate(command, 80), "{what} detected but allowed");
        }

        if self.in_allowlist(command) {
            request.result = ApprovalOutcome::Approved;
            request.reason = Some("In allowlist".into());
            request.approved_by = Some("allowlist".into());
            self.log(&request);
            return request;
        }

        if self.settings.auto_approve_read_only && self.is_read_only(command) {
            request.result = ApprovalOutcome::Approved;
            request.reason = Some("Read-only command".into());
            request.approved_by = Some("auto".into());
            self.log(&request);
            return request;
        }

        match self.settings.default_policy {
            DefaultPolicy::Allow => {
                request.result = ApprovalOutcome::Approved;
                // Keep a dangerous/denylist note when one was recorded — the
                // audit line is the only place the risk signal survives.
                if request.reason.is_none() {
                    request.reason = Some("Default policy: allow".into());
                }
                request.approved_by = Some("auto".into());
            }
            DefaultPolicy::Deny => {
                request.result = ApprovalOutcome::Denied;
                request.reason = Some("Default policy: deny".into());
            }
            DefaultPolicy::Ask => {
                let callback = self.callback.lock().unwrap_or_else(|p| p.into_inner());
                match callback.as_ref() {
                    Some(cb) => {
                        request.result = cb.decide(&request);
                        if request.result == ApprovalOutcome::Approved {
                            request.approved_by = Some("user".into());
                        }
                    }
                    None => {
                        // No hook registered: the caller must suspend and
                        // resume once a decision arrives out of band.
                        request.result = ApprovalOutcome::Pending;
                        request.reason = Some("No approval callback configured".into());
                    }
                }
            }
        }

        self.log(&request);
        request
    }

    fn is_dangerous(&self, command: &str) -> bool {
        self.dangerous_patterns.iter().any(|p| p.is_match(command))
    }

    fn in_denylist(&self, command: &str) -> bool {
        let cmd = command.to_lowercase();
        self.dangerous_commands.iter().any(|d| cmd.contains(d))
    }

    fn in_allowlist(&self, command: &str) -> bool {
        let parts: Vec<&str> = command.split_whitespace().collect();
        let Some(base) = parts.first() else {
            return false;
        };
        let base = base.to_lowercase();
        if self.safe_commands.contains(&base) {
            return true;
        }
        if let Some(second) = parts.get(1) {
            let with_arg = format!("{base} {}", second.to_lowercase());
            if self.safe_commands.contains(&with_arg) {
                return true;
            }
        }
        false
    }

    fn is_read_only(&self, command: &str) -> bool {
        let cmd = command.to_lowercase();
        !WRITE_INDICATORS.iter().any(|w| cmd.contains(w))
    }

    fn log(&self, request: &ExecRequest) {
        let entry = AuditEntry {
            id: request.id.clone(),
            timestamp: request.timestamp,
            command: request.command.clone(),
            tool: request.tool_name.clone(),
            session: request.session_key.clone(),
            result: request.result.to_string(),
            reason: request.reason.clone(),
            approved_by: request.approved_by.clone(),
        };
        let _guard = self.log_lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = audit::append(&self.log_path, &entry) {
            warn!("failed to write approval audit entry: {e:#}");
        }
    }

    /// Approval statistics over the last 1000 audit entries.
    pub fn stats(&self) -> ApprovalStats {
        let logs = audit::read_recent(&self.log_path, 1000);
        let mut by_result: HashMap<String, usize> = HashMap::new();
        let mut by_tool: HashMap<String, usize> = HashMap::new();
        for log in &logs {
            *by_result.entry(log.result.clone()).or_default() += 1;
            *by_tool.entry(log.tool.clone()).or_default() += 1;
        }
        ApprovalStats {
            total_requests: logs.len(),
            by_result,
            by_tool,
            allowlist_size: self.safe_commands.len(),
            denylist_size: self.dangerous_commands.len(),
        }
    }

    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        audit::read_recent(&self.log_path, limit)
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
