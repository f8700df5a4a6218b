// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;

/// One queued unit of work for a circuits poll.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedEvent {
    pub text: String,
    /// Origin tag for audit ("watcher", "api", "self", ...).
    pub source: String,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
}

/// Process-wide, session-keyed FIFO of text events.
///
/// The circuits runner drains a session's queue at the start of each poll;
/// producers (the event watcher, API handlers, the agent itself) enqueue
/// from any thread.
#[derive(Default)]
pub struct EventQueue {
    inner: Mutex<HashMap<String, VecDeque<QueuedEvent>>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, session_key: &str, text: impl Into<String>, source: impl Into<String>) {
        let event = QueuedEvent {
            text: text.into(),
            source: source.into(),
            enqueued_at: chrono::Utc::now(),
        };
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.entry(session_key.to_string()).or_default().push_back(event);
    }

    /// Remove and return every queued event for a session, FIFO order.
    pub fn drain(&self, session_key: &str) -> Vec<QueuedEvent> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner
            .remove(session_key)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default()
    }

    /// The oldest queued event without removing it.
    pub fn peek(&self, session_key: &str) -> Option<QueuedEvent> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.get(session_key).and_then(|q| q.front().cloned())
    }

    pub fn has(&self, session_key: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.get(session_key).map(|q| !q.is_empty()).unwrap_or(false)
    }

    /// Drop all events for a session, returning how many were discarded.
    pub fn clear(&self, session_key: &str) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.remove(session_key).map(|q| q.len()).unwrap_or(0)
    }

    /// Queue depth per session key.
    pub fn stats(&self) -> HashMap<String, usize> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(k, q)| (k.clone(), q.len()))
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_then_drain_is_fifo() {
        let q = EventQueue::new();
        q.enqueue("main", "first", "test");
        q.enqueue("main", "second", "test");
        let events = q.drain("main");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].text, "first");
        assert_eq!(events[1].text, "second");
    }

    #[test]
    fn drain_empties_the_queue() {
        let q = EventQueue::new();
        q.enqueue("main", "x", "test");
        q.drain("main");
        assert!(!q.has("main"));
        assert!(q.drain("main").is_empty());
    }

    #[test]
    fn sessions_are_isolated() {
        let q = EventQueue::new();
        q.enqueue("main", "for main", "test");
        q.enqueue("side", "for side", "test");
        assert_eq!(q.drain("side").len(), 1);
        assert!(q.has("main"));
    }

    #[test]
    fn peek_does_not_remove() {
        let q = EventQueue::new();
        q.enqueue("main", "keep", "test");
        assert_eq!(q.peek("main").unwrap().text, "keep");
        assert!(q.has("main"));
    }

    #[test]
    fn clear_returns_discarded_count() {
        let q = EventQueue::new();
        q.enqueue("main", "a", "t");
        q.enqueue("main", "b", "t");
        assert_eq!(q.clear("main"), 2);
        assert!(!q.has("main"));
        assert_eq!(q.clear("main"), 0);
    }

    #[test]
    fn stats_report_depth_per_session() {
        let q = EventQueue::new();
        q.enqueue("a", "1", "t");
        q.enqueue("a", "2", "t");
        q.enqueue("b", "3", "t");
        let stats = q.stats();
        assert_eq!(stats.get("a"), Some(&2));
        assert_eq!(stats.get("b"), Some(&1));
    }

    #[test]
    fn source_tag_is_preserved() {
        let q = EventQueue::new();
        q.enqueue("main", "x", "watcher");
        assert_eq!(q.drain("main")[0].source, "watcher");
    }
}
