// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Word-overlap threshold above which two lessons are considered the same
/// and consolidated.
const CONSOLIDATE_SIMILARITY: f32 = 0.6;

/// Relevance half-life in days for time decay.
const DECAY_HALF_LIFE_DAYS: f32 = 30.0;

/// One captured piece of experiential knowledge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    pub id: String,
    /// Situation trigger: when does this lesson apply.
    pub pattern: String,
    /// The corrective text.
    pub lesson: String,
    /// Category, e.g. "tool_failure" or "correction".
    pub kind: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub relevance_score: f32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied: Option<chrono::DateTime<chrono::Utc>>,
}

pub struct LessonStore {
    path: PathBuf,
    lessons: Mutex<Vec<Lesson>>,
}

impl LessonStore {
    /// Open (or create) the store at `path`.  A missing or unreadable file
    /// yields an empty store rather than an error — lessons are an
    /// enhancement, never a startup blocker.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lessons = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        Self {
            path,
            lessons: Mutex::new(lessons),
        }
    }

    pub fn len(&self) -> usize {
        self.lessons.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Lesson> {
        self.lessons
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Add a lesson, consolidating into an existing near-duplicate when the
    /// pattern overlap is high.  Returns the id of the (new or merged)
    /// lesson.
    pub fn add(
        &self,
        pattern: &str,
        lesson: &str,
        kind: &str,
        tags: Vec<String>,
    ) -> anyhow::Result<String> {
        let mut lessons = self.lessons.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(existing) = lessons
            .iter_mut()
            .find(|l| word_similarity(&l.pattern, pattern) >= CONSOLIDATE_SIMILARITY)
        {
            debug!(id = %existing.id, "consolidating near-duplicate lesson");
            existing.relevance_score = (existing.relevance_score + 0.2).min(2.0);
            existing.last_applied = Some(chrono::Utc::now());
            for tag in tags {
                if !existing.tags.contains(&tag) {
                    existing.tags.push(tag);
                }
            }
            // Keep the longer corrective text — it usually subsumes the
            // shorter one.
            if lesson.len() > existing.lesson.len() {
                existing.lesson = lesson.to_string();
            }
            let id = existing.id.clone();
            Self::persist(&self.path, &lessons)?;
            return Ok(id);
        }

        let entry = Lesson {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            pattern: pattern.to_string(),
            lesson: lesson.to_string(),
            kind: kind.to_string(),
            tags,
            relevance_score: 1.0,
            created_at: chrono::Utc::now(),
            last_applied: None,
        };
        let id = entry.id.clone();
        lessons.push(entry);
        Self::persist(&self.path, &lessons)?;
        Ok(id)
    }

    /// Lessons ranked against `query` by word overlap weighted with the
    /// decayed relevance score.  Zero-overlap lessons are excluded.
    pub fn relevant(&self, query: &str, limit: usize) -> Vec<Lesson> {
        let lessons = self.lessons.lock().unwrap_or_else(|p| p.into_inner());
        let now = chrono::Utc::now();
        let mut scored: Vec<(f32, Lesson)> = lessons
            .iter()
            .filter_map(|l| {
                let overlap = word_similarity(&l.pattern, query);
                if overlap <= 0.0 {
                    return None;
                }
                Some((overlap * decayed_relevance(l, now), l.clone()))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(limit).map(|(_, l)| l).collect()
    }

    /// Apply time decay to every stored relevance score and persist.
    /// Intended to run occasionally (e.g. at startup).
    pub fn decay(&self) -> anyhow::Result<()> {
        let mut lessons = self.lessons.lock().unwrap_or_else(|p| p.into_inner());
        let now = chrono::Utc::now();
        for l in lessons.iter_mut() {
            l.relevance_score = decayed_relevance(l, now);
            l.created_at = now;
        }
        Self::persist(&self.path, &lessons)
    }

    /// Rewrite the store atomically: write a temp file, then rename over
    /// the original.
    fn persist(path: &PathBuf, lessons: &[Lesson]) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(lessons).context("serialising lessons")?;
        std::fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            warn!("lesson store rename failed, falling back to direct write: {e}");
            let text = serde_json::to_string_pretty(lessons)?;
            std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
        }
        Ok(())
    }
}

/// Relevance after exponential time decay with a 30-day half-life.
fn decayed_relevance(lesson: &Lesson, now: chrono::DateTime<chrono::Utc>) -> f32 {
    let age_days = (now - lesson.created_at).num_hours() as f32 / 24.0;
    if age_days <= 0.0 {
        return lesson.relevance_score;
    }
    lesson.relevance_score * 0.5_f32.powf(age_days / DECAY_HALF_LIFE_DAYS)
}

/// Jaccard similarity of lowercase word sets.
fn word_similarity(a: &str, b: &str) -> f32 {
    let wa: HashSet<String> = a.split_whitespace().map(|w| w.to_lowercase()).collect();
    let wb: HashSet<String> = b.split_whitespace().map(|w| w.to_lowercase()).collect();
    if wa.is_empty() || wb.is_empty() {
        return 0.0;
    }
    let intersection = wa.intersection(&wb).count() as f32;
    let union = wa.union(&wb).count() as f32;
    intersection / union
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
