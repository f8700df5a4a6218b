// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Agent-managed task list in CIRCUITS.md.
//!
//! The circuits file is operator-editable Markdown with two sections the
//! agent maintains itself — this is how it schedules its own recurring
//! work:
//!
//! ```markdown
//! # CIRCUITS.md
//!
//! ## Active Tasks
//! - Task description one
//!
//! ## Completed
//! - [2026-02-09] Task that was finished
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CircuitsTasks {
    pub active: Vec<String>,
    pub completed: Vec<String>,
}

pub struct CircuitsFile {
    path: PathBuf,
}

impl CircuitsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the current task sections.  A missing file reads as empty.
    pub fn read(&self) -> CircuitsTasks {
        let content = std::fs::read_to_string(&self.path).unwrap_or_default();
        parse_sections(&content)
    }

    pub fn add_task(&self, task: &str) -> anyhow::Result<()> {
        let mut tasks = self.read();
        let task = task.trim();
        if task.is_empty() || tasks.active.iter().any(|t| t == task) {
            return Ok(());
        }
        tasks.active.push(task.to_string());
        self.write(&tasks)
    }

    /// Move a task (matched by substring) from active to completed with a
    /// date stamp.  Returns whether a task matched.
    pub fn complete_task(&self, needle: &str) -> anyhow::Result<bool> {
        let mut tasks = self.read();
        let Some(pos) = tasks
            .active
            .iter()
            .position(|t| t.to_lowercase().contains(&needle.to_lowercase()))
        else {
            return Ok(false);
        };
        let task = tasks.active.remove(pos);
        let stamp = chrono::Local::now().format("%Y-%m-%d");
        tasks.completed.push(format!("[{stamp}] {task}"));
        self.write(&tasks)?;
        Ok(true)
    }

    /// Remove an active task by substring match.  Returns whether a task
    /// matched.
    pub fn remove_task(&self, needle: &str) -> anyhow::Result<bool> {
        let mut tasks = self.read();
        let before = tasks.active.len();
        tasks
            .active
            .retain(|t| !t.to_lowercase().contains(&needle.to_lowercase()));
        if tasks.active.len() == before {
            return Ok(false);
        }
        self.write(&tasks)?;
        Ok(true)
    }

    fn write(&self, tasks: &CircuitsTasks) -> anyhow::Result<()> {
        std::fs::write(&self.path, rebuild(tasks))
            .with_context(|| format!("writing {}", self.path.display()))
    }
}

fn parse_sections(content: &str) -> CircuitsTasks {
    // HTML comments are operator notes, not tasks.
    let clean = regex::Regex::new(r"(?s)<!--.*?-->")
        .map(|re| re.replace_all(content, "").to_string())
        .unwrap_or_else(|_| content.to_string());

    #[derive(PartialEq)]
    enum Section {
        Active,
        Completed,
        Other,
    }

    let mut tasks = CircuitsTasks::default();
    let mut current = Section::Other;
    for line in clean.lines() {
        let stripped = line.trim();
        let lower = stripped.to_lowercase();
        if lower.starts_with("## active") {
            current = Section::Active;
            continue;
        }
        if lower.starts_with("## completed") {
            current = Section::Completed;
            continue;
        }
        if stripped.starts_with("## ") {
            current = Section::Other;
            continue;
        }
        if let Some(task) = stripped.strip_prefix("- ") {
            let task = task.trim();
            if task.is_empty() {
                continue;
            }
            match current {
                Section::Active => tasks.active.push(task.to_string()),
                Section::Completed => tasks.completed.push(task.to_string()),
                Section::Other => {}
            }
        }
    }
    tasks
}

fn rebuild(tasks: &CircuitsTasks) -> String {
    let mut lines = vec!["# CIRCUITS.md".to_string(), String::new(), String::new()];

    lines.push("## Active Tasks".into());
    lines.push(String::new());
    if tasks.active.is_empty() {
        lines.push("<!-- No active tasks -->".into());
    } else {
        for task in &tasks.active {
            lines.push(format!("- {task}"));
        }
    }
    lines.push(String::new());
    lines.push(String::new());

    lines.push("## Completed".into());
    lines.push(String::new());
    if tasks.completed.is_empty() {
        lines.push("<!-- No completed tasks yet -->".into());
    } else {
        for task in &tasks.completed {
            lines.push(format!("- {task}"));
        }
    }
    lines.push(String::new());

    lines.join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn file() -> (CircuitsFile, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (CircuitsFile::new(dir.path().join("CIRCUITS.md")), dir)
    }

    #[test]
    fn missing_file_reads_empty() {
        let (f, _d) = file();
        assert_eq!(f.read(), CircuitsTasks::default());
    }

    #[test]
    fn add_task_round_trips() {
        let (f, _d) = file();
        f.add_task("water the plants").unwrap();
        f.add_task("check the backups").unwrap();
        let tasks = f.read();
        assert_eq!(tasks.active, vec!["water the plants", "check the backups"]);
    }

    #[test]
    fn add_duplicate_task_is_noop() {
        let (f, _d) = file();
        f.add_task("once").unwrap();
        f.add_task("once").unwrap();
        assert_eq!(f.read().active.len(), 1);
    }

    #[test]
    fn complete_task_moves_with_date_stamp() {
        let (f, _d) = file();
        f.add_task("rotate the logs").unwrap();
        assert!(f.complete_task("rotate").unwrap());
        let tasks = f.read();
        assert!(tasks.active.is_empty());
        assert_eq!(tasks.completed.len(), 1);
        assert!(tasks.completed[0].contains("rotate the logs"));
        assert!(tasks.completed[0].starts_with('['), "date stamp expected");
    }

    #[test]
    fn complete_unmatched_returns_false() {
        let (f, _d) = file();
        f.add_task("a task").unwrap();
        assert!(!f.complete_task("nonexistent").unwrap());
    }

    #[test]
    fn remove_task_by_substring() {
        let (f, _d) = file();
        f.add_task("watch the oven").unwrap();
        f.add_task("other thing").unwrap();
        assert!(f.remove_task("oven").unwrap());
        assert_eq!(f.read().active, vec!["other thing"]);
    }

    #[test]
    fn html_comments_are_not_tasks() {
        let (f, d) = file();
        std::fs::write(
            d.path().join("CIRCUITS.md"),
            "# CIRCUITS.md\n\n## Active Tasks\n\n<!-- No active tasks -->\n",
        )
        .unwrap();
        assert!(f.read().active.is_empty());
    }

    #[test]
    fn parses_hand_edited_file() {
        let (f, d) = file();
        std::fs::write(
            d.path().join("CIRCUITS.md"),
            "# CIRCUITS.md\n## Active Tasks\n- one\n-   two  \n## Completed\n- [2026-01-01] done\n## Notes\n- not a task\n",
        )
        .unwrap();
        let tasks = f.read();
        assert_eq!(tasks.active, vec!["one", "two"]);
        assert_eq!(tasks.completed, vec!["[2026-01-01] done"]);
    }
}
