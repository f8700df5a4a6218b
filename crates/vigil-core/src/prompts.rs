// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! System-prompt composition from operator-editable files.
//!
//! The prompt is assembled from markdown files at the workspace root:
//! `SUBSTRATE.md` (identity), `CIRCUITS.md` (recurring tasks), `PRIME.md`
//! (startup actions), and `TOOL_PROMPT.md` (tool style guidance).  Missing
//! files fall back to built-in defaults, so a bare checkout still produces
//! a working agent.

use std::path::Path;

const FALLBACK_IDENTITY: &str = "You are vigil, an always-on autonomous agent. \
You act on the user's behalf using the tools available to you, and you keep \
your responses direct and concrete.";

const TOOL_STYLE: &str = "When a task needs information you do not have, or an \
action on the system, use a tool rather than guessing. Prefer small verifiable \
steps; read before you write.";

/// Quiet-token contract included in every prompt so background polls can be
/// suppressed reliably.
const QUIET_CONTRACT: &str = "Background polls: when a circuits poll finds \
nothing needing attention, reply with exactly CIRCUITS_OK. When your entire \
response would be a no-op, reply with exactly [SILENT]. These tokens must be \
the whole message; never append them to a real reply.";

fn load_file(root: &Path, name: &str) -> Option<String> {
    let text = std::fs::read_to_string(root.join(name)).ok()?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Compose the full system prompt for the main agent.
pub fn compose_system_prompt(root: &Path, tool_names: &[String]) -> String {
    let mut sections: Vec<String> = Vec::new();

    // Identity
    sections.push(
        load_file(root, "SUBSTRATE.md").unwrap_or_else(|| FALLBACK_IDENTITY.to_string()),
    );

    // Tooling
    if !tool_names.is_empty() {
        let mut tooling = format!("Available tools: {}.", tool_names.join(", "));
        tooling.push('\n');
        tooling.push_str(&load_file(root, "TOOL_PROMPT.md").unwrap_or_else(|| TOOL_STYLE.into()));
        sections.push(tooling);
    }

    // Recurring tasks
    if let Some(circuits) = load_file(root, "CIRCUITS.md") {
        sections.push(format!("## Recurring tasks (CIRCUITS.md)\n{circuits}"));
    }

    // Startup actions
    if let Some(prime) = load_file(root, "PRIME.md") {
        sections.push(format!("## Startup (PRIME.md)\n{prime}"));
    }

    sections.push(QUIET_CONTRACT.to_string());

    sections.push(format!(
        "Current date: {}",
        chrono::Local::now().format("%Y-%m-%d")
    ));

    sections.join("\n\n")
}

/// Minimal system prompt for an isolated subagent.
pub fn subagent_system_prompt(name: &str, tool_names: &[String]) -> String {
    let mut prompt = format!(
        "You are {name}, a focused sub-agent. Complete the task you are given and \
         report the result as plain text. Do not start side quests."
    );
    if !tool_names.is_empty() {
        prompt.push_str(&format!("\nAvailable tools: {}.", tool_names.join(", ")));
    }
    prompt
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
