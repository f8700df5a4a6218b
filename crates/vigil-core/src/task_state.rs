// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Interrupted / overflowed task snapshots.
//!
//! On max-round exit, interrupt, or approval suspension the loop serialises
//! enough state that the next session can detect the unfinished task and
//! resume it.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::session::ToolHistoryEntry;

const TASK_STATE_FILE: &str = "task_state.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub task: String,
    pub tool_history: Vec<ToolHistoryEntry>,
    pub round_count: u32,
    pub model: String,
}

fn state_path(data_dir: &Path) -> PathBuf {
    data_dir.join(TASK_STATE_FILE)
}

pub fn save(data_dir: &Path, state: &TaskState) -> anyhow::Result<()> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    let path = state_path(data_dir);
    let text = serde_json::to_string_pretty(state).context("serialising task state")?;
    std::fs::write(&path, text).with_context(|| format!("writing {}", path.display()))
}

/// Load a pending snapshot, if one exists and parses.
pub fn load(data_dir: &Path) -> Option<TaskState> {
    let path = state_path(data_dir);
    let text = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&text) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(path = %path.display(), "unreadable task state ignored: {e}");
            None
        }
    }
}

/// Remove the snapshot (on natural task completion).
pub fn clear(data_dir: &Path) {
    let _ = std::fs::remove_file(state_path(data_dir));
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn state(round_count: u32) -> TaskState {
        TaskState {
            task: "list the files".into(),
            tool_history: vec![ToolHistoryEntry {
                tool: "bash".into(),
                args: serde_json::json!({"command": "ls"}),
                result: "a.txt".into(),
                success: true,
                auto_executed: true,
            }],
            round_count,
            model: "gpt-4o".into(),
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &state(7)).unwrap();
        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.task, "list the files");
        assert_eq!(loaded.round_count, 7);
        assert_eq!(loaded.tool_history.len(), 1);
        assert_eq!(loaded.model, "gpt-4o");
    }

    #[test]
    fn load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).is_none());
    }

    #[test]
    fn clear_removes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &state(1)).unwrap();
        clear(dir.path());
        assert!(load(dir.path()).is_none());
    }

    #[test]
    fn clear_on_missing_file_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        clear(dir.path());
    }

    #[test]
    fn corrupt_snapshot_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(TASK_STATE_FILE), "{broken").unwrap();
        assert!(load(dir.path()).is_none());
    }
}
