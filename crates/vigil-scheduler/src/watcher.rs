// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! File-based event watcher.
//!
//! Polls a directory for JSON event files:
//!
//! ```json
//! { "type": "immediate" | "scheduled" | "recurring",
//!   "text": "<prompt>",
//!   "channelId": "<session>",
//!   "at": "<ISO timestamp>",
//!   "schedule": "<cron expression>",
//!   "wake": "now" }
//! ```
//!
//! `immediate` events enqueue at once (optionally waking circuits) and the
//! file is deleted.  `scheduled` events fire once at `at`, then the file is
//! deleted.  `recurring` events fire per cron schedule and the file
//! persists.  Malformed files are logged and left in place so the operator
//! can fix them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::circuits::CIRCUITS_SESSION;
use crate::queue::EventQueue;

#[derive(Debug, Deserialize)]
struct EventFile {
    #[serde(rename = "type")]
    kind: String,
    text: String,
    #[serde(rename = "channelId")]
    channel_id: Option<String>,
    at: Option<String>,
    schedule: Option<String>,
    wake: Option<String>,
}

/// Called when an event carries `wake: "now"` — typically
/// `CircuitsRunner::request_now`.
pub type WakeHook = Arc<dyn Fn() + Send + Sync>;

pub struct EventWatcher {
    dir: PathBuf,
    queue: Arc<EventQueue>,
    wake: Option<WakeHook>,
    poll_interval: Duration,
    /// Last fire time per recurring file, keyed by path.  In-memory: after a
    /// restart, recurring events fire from "now" forward.
    last_fired: Mutex<HashMap<PathBuf, chrono::DateTime<chrono::Utc>>>,
}

impl EventWatcher {
    pub fn new(
        dir: impl Into<PathBuf>,
        queue: Arc<EventQueue>,
        wake: Option<WakeHook>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            dir: dir.into(),
            queue,
            wake,
            poll_interval,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    /// Poll loop; runs until the owning task is aborted.
    pub async fn run(self: Arc<Self>) {
        info!(dir = %self.dir.display(), "event watcher started");
        loop {
            self.scan_once(chrono::Utc::now());
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// One scan pass; `now` is injected for testability.  Returns the number
    /// of events dispatched.
    pub fn scan_once(&self, now: chrono::DateTime<chrono::Utc>) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        let mut dispatched = 0;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let event = match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|text| serde_json::from_str::<EventFile>(&text).map_err(Into::into))
            {
                Ok(ev) => ev,
                Err(e) => {
                    warn!(path = %path.display(), "skipping malformed event file: {e}");
                    continue;
                }
            };
            dispatched += self.dispatch(&path, &event, now);
        }
        dispatched
    }

    fn dispatch(&self, path: &Path, event: &EventFile, now: chrono::DateTime<chrono::Utc>) -> usize {
        let session = event.channel_id.as_deref().unwrap_or(CIRCUITS_SESSION);
        match event.kind.as_str() {
            "immediate" => {
                debug!(path = %path.display(), "dispatching immediate event");
                self.queue.enqueue(session, &event.text, "watcher");
                if event.wake.as_deref() == Some("now") {
                    if let Some(wake) = &self.wake {
                        wake();
                    }
                }
                self.remove(path);
                1
            }
            "scheduled" => {
                let Some(at) = event.at.as_deref().and_then(parse_timestamp) else {
                    warn!(path = %path.display(), "scheduled event has no parseable 'at'");
                    return 0;
                };
                if now < at {
                    return 0;
                }
                debug!(path = %path.display(), "firing scheduled event");
                self.queue.enqueue(session, &event.text, "watcher");
                self.remove(path);
                1
            }
            "recurring" => {
                let Some(spec) = event.schedule.as_deref() else {
                    warn!(path = %path.display(), "recurring event missing 'schedule'");
                    return 0;
                };
                let schedule = match cron::Schedule::from_str(spec) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(path = %path.display(), "invalid cron schedule {spec:?}: {e}");
                        return 0;
                    }
                };
                let mut last_fired = self.last_fired.lock().unwrap_or_else(|p| p.into_inner());
                let since = last_fired.get(path).copied().unwrap_or(now);
                let due = schedule.after(&since).next().filter(|t| *t <= now);
                // First sighting establishes the baseline without firing.
                last_fired.entry(path.to_path_buf()).or_insert(now);
                match due {
                    Some(_) => {
                        debug!(path = %path.display(), "firing recurring event");
                        self.queue.enqueue(session, &event.text, "watcher");
                        last_fired.insert(path.to_path_buf(), now);
                        1
                    }
                    None => 0,
                }
            }
            other => {
                warn!(path = %path.display(), "unknown event type {other:?}");
                0
            }
        }
    }

    fn remove(&self, path: &Path) {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), "failed to delete dispatched event file: {e}");
        }
    }
}

fn parse_timestamp(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&chrono::Utc))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
