// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Experiential-lesson extraction from tool history.
//!
//! After a run with enough tool activity, a detached task analyses what
//! happened against the task description and writes corrective lessons to
//! the store.  Extraction is deterministic (failure patterns, error→success
//! corrections) so it costs nothing and never blocks the returned result.

use std::sync::Arc;

use tracing::debug;

use vigil_memory::LessonStore;

use crate::session::ToolHistoryEntry;

/// Minimum tool calls before extraction is worth running.
pub const MIN_CALLS_FOR_EXTRACTION: usize = 3;

/// A lesson candidate before it reaches the store.
#[derive(Debug, Clone, PartialEq)]
pub struct LessonCandidate {
    pub pattern: String,
    pub lesson: String,
    pub kind: String,
    pub tags: Vec<String>,
}

/// Derive lesson candidates from one run's tool history.
pub fn extract_lessons(task: &str, history: &[ToolHistoryEntry]) -> Vec<LessonCandidate> {
    let mut lessons = Vec::new();

    // Repeated failures of the same tool.
    let mut tools: Vec<&str> = history.iter().map(|e| e.tool.as_str()).collect();
    tools.sort_unstable();
    tools.dedup();
    for tool in &tools {
        let failures: Vec<&ToolHistoryEntry> = history
            .iter()
            .filter(|e| e.tool == *tool && !e.success)
            .collect();
        if failures.len() >= 2 {
            let first_error: String = failures[0].result.chars().take(120).collect();
            lessons.push(LessonCandidate {
                pattern: format!("{tool} failing repeatedly during: {task}"),
                lesson: format!(
                    "{tool} failed {} times ({first_error}); verify arguments and \
                     preconditions before invoking it again.",
                    failures.len()
                ),
                kind: "tool_failure".into(),
                tags: vec![tool.to_string()],
            });
        }
    }

    // Error followed by success of the same tool: the retry found the right
    // approach.
    for window in history.windows(2) {
        let (a, b) = (&window[0], &window[1]);
        if a.tool == b.tool && !a.success && b.success {
            let error: String = a.result.chars().take(120).collect();
            lessons.push(LessonCandidate {
                pattern: format!("{} fails with: {error}", a.tool),
                lesson: format!(
                    "When {} fails like this, the retry that worked used arguments: {}",
                    a.tool,
                    serde_json::to_string(&b.args).unwrap_or_default()
                ),
                kind: "correction".into(),
                tags: vec![a.tool.clone()],
            });
        }
    }

    lessons
}

/// Fire-and-forget extraction into the store.
pub fn spawn_extraction(store: Arc<LessonStore>, task: String, history: Vec<ToolHistoryEntry>) {
    if history.len() < MIN_CALLS_FOR_EXTRACTION {
        return;
    }
    tokio::spawn(async move {
        let candidates = extract_lessons(&task, &history);
        debug!(count = candidates.len(), "extracted lesson candidates");
        for c in candidates {
            if let Err(e) = store.add(&c.pattern, &c.lesson, &c.kind, c.tags) {
                tracing::warn!("failed to store lesson: {e:#}");
            }
        }
    });
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
