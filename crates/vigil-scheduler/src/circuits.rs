// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The circuits runner: a periodic background poll that lets the agent act
//! on self-scheduled events without user input.
//!
//! Each poll drains the event queue into a synthetic prompt and runs it
//! through the [`PollHandler`] (the agent loop).  The prompt carries the
//! quiet-token contract: `CIRCUITS_OK` means nothing needs attention,
//! `[SILENT]` means the whole response is a no-op; both are suppressed from
//! the user-facing channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Timelike;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::queue::{EventQueue, QueuedEvent};

/// Response meaning "checked, nothing to do".
pub const CIRCUITS_OK_TOKEN: &str = "CIRCUITS_OK";
/// Response meaning "this entire message is a no-op".
pub const SILENT_TOKEN: &str = "[SILENT]";

/// The session key circuits polls run against.
pub const CIRCUITS_SESSION: &str = "main";

/// Whether a response is one of the quiet tokens and must not reach the
/// front-end.
pub fn is_quiet_response(text: &str) -> bool {
    let t = text.trim();
    t == CIRCUITS_OK_TOKEN || t.starts_with(SILENT_TOKEN)
}

/// What the runner needs from the host: run a poll prompt through the agent
/// loop, report busyness, and forward substantive output.
#[async_trait]
pub trait PollHandler: Send + Sync {
    /// Run one poll prompt to completion and return the final response text.
    async fn handle_poll(&self, prompt: String) -> anyhow::Result<String>;
    /// True while a user request is in flight; polls are skipped.
    fn is_busy(&self) -> bool;
    /// Forward a substantive (non-quiet) poll response to the front-end.
    async fn deliver(&self, text: String);
}

pub struct CircuitsRunner {
    queue: Arc<EventQueue>,
    handler: Arc<dyn PollHandler>,
    interval: Duration,
    /// `(start_hour, end_hour)`; gating applies only when set.
    active_hours: Option<(u8, u8)>,
    wake: Notify,
}

impl CircuitsRunner {
    pub fn new(
        queue: Arc<EventQueue>,
        handler: Arc<dyn PollHandler>,
        interval: Duration,
        active_hours: Option<(u8, u8)>,
    ) -> Self {
        Self {
            queue,
            handler,
            interval,
            active_hours,
            wake: Notify::new(),
        }
    }

    /// Force an immediate poll, out of band of the interval timer.
    pub fn request_now(&self) {
        self.wake.notify_one();
    }

    /// Run the poll loop until the owning task is aborted.
    pub async fn run(self: Arc<Self>) {
        info!(interval_secs = self.interval.as_secs(), "circuits runner started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.wake.notified() => {
                    debug!("circuits poll requested out of band");
                }
            }
            self.poll_once(chrono::Local::now().time().hour() as u8).await;
        }
    }

    /// One poll iteration.  `current_hour` is injected for testability.
    pub async fn poll_once(&self, current_hour: u8) {
        if !self.within_active_hours(current_hour) {
            debug!(current_hour, "circuits poll skipped: outside active hours");
            return;
        }
        if self.handler.is_busy() {
            debug!("circuits poll skipped: agent busy");
            return;
        }

        let events = self.queue.drain(CIRCUITS_SESSION);
        let prompt = build_poll_prompt(&events);

        match self.handler.handle_poll(prompt).await {
            Ok(response) => {
                if is_quiet_response(&response) {
                    debug!("circuits poll quiet; suppressing response");
                } else if !response.trim().is_empty() {
                    self.handler.deliver(response).await;
                }
            }
            Err(e) => warn!("circuits poll failed: {e:#}"),
        }
    }

    /// Active-hours gate; the window may wrap around midnight.
    fn within_active_hours(&self, hour: u8) -> bool {
        match self.active_hours {
            None => true,
            Some((start, end)) if start == end => true,
            Some((start, end)) if start < end => hour >= start && hour < end,
            Some((start, end)) => hour >= start || hour < end,
        }
    }
}

/// Compose the synthetic poll prompt: the quiet-token contract plus any
/// queued events.
pub fn build_poll_prompt(events: &[QueuedEvent]) -> String {
    let mut prompt = String::from(
        "Circuits poll: review your recurring tasks and any pending events below. \
         Take action where something needs attention.\n\
         If nothing needs attention, reply with exactly: CIRCUITS_OK\n\
         If your entire response would be a no-op, reply with exactly: [SILENT]\n\
         Never append these tokens to a real response.",
    );
    if !events.is_empty() {
        prompt.push_str("\n\nPending events:\n");
        for event in events {
            prompt.push_str(&format!("- [{}] {}\n", event.source, event.text));
        }
    }
    prompt
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingHandler {
        busy: AtomicBool,
        response: Mutex<String>,
        prompts: Mutex<Vec<String>>,
        delivered: Mutex<Vec<String>>,
        polls: AtomicUsize,
    }

    impl RecordingHandler {
        fn new(response: &str) -> Arc<Self> {
            Arc::new(Self {
                busy: AtomicBool::new(false),
                response: Mutex::new(response.to_string()),
                prompts: Mutex::new(Vec::new()),
                delivered: Mutex::new(Vec::new()),
                polls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PollHandler for RecordingHandler {
        async fn handle_poll(&self, prompt: String) -> anyhow::Result<String> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt);
            Ok(self.response.lock().unwrap().clone())
        }
        fn is_busy(&self) -> bool {
            self.busy.load(Ordering::SeqCst)
        }
        async fn deliver(&self, text: String) {
            self.delivered.lock().unwrap().push(text);
        }
    }

    fn runner(handler: Arc<RecordingHandler>, hours: Option<(u8, u8)>) -> CircuitsRunner {
        CircuitsRunner::new(
            Arc::new(EventQueue::new()),
            handler,
            Duration::from_secs(1800),
            hours,
        )
    }

    // ── Quiet tokens ──────────────────────────────────────────────────────────

    #[test]
    fn circuits_ok_is_quiet() {
        assert!(is_quiet_response("CIRCUITS_OK"));
        assert!(is_quiet_response("  CIRCUITS_OK  "));
    }

    #[test]
    fn silent_token_is_quiet() {
        assert!(is_quiet_response("[SILENT]"));
        assert!(is_quiet_response("[SILENT] trailing noise"));
    }

    #[test]
    fn substantive_text_is_not_quiet() {
        assert!(!is_quiet_response("The backup failed overnight."));
        assert!(!is_quiet_response("all good, CIRCUITS_OK"));
    }

    // ── Polling ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn quiet_response_is_suppressed() {
        let handler = RecordingHandler::new("CIRCUITS_OK");
        let r = runner(Arc::clone(&handler), None);
        r.poll_once(12).await;
        assert_eq!(handler.polls.load(Ordering::SeqCst), 1);
        assert!(handler.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn substantive_response_is_delivered() {
        let handler = RecordingHandler::new("Disk almost full on /var.");
        let r = runner(Arc::clone(&handler), None);
        r.poll_once(12).await;
        let delivered = handler.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].contains("Disk"));
    }

    #[tokio::test]
    async fn busy_handler_skips_poll() {
        let handler = RecordingHandler::new("CIRCUITS_OK");
        handler.busy.store(true, Ordering::SeqCst);
        let r = runner(Arc::clone(&handler), None);
        r.poll_once(12).await;
        assert_eq!(handler.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn outside_active_hours_skips_poll() {
        let handler = RecordingHandler::new("CIRCUITS_OK");
        let r = runner(Arc::clone(&handler), Some((9, 17)));
        r.poll_once(3).await;
        assert_eq!(handler.polls.load(Ordering::SeqCst), 0);
        r.poll_once(10).await;
        assert_eq!(handler.polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wrap_around_active_window() {
        let handler = RecordingHandler::new("CIRCUITS_OK");
        let r = runner(Arc::clone(&handler), Some((22, 6)));
        r.poll_once(23).await;
        r.poll_once(2).await;
        assert_eq!(handler.polls.load(Ordering::SeqCst), 2);
        r.poll_once(12).await;
        assert_eq!(handler.polls.load(Ordering::SeqCst), 2, "midday outside 22..6");
    }

    #[tokio::test]
    async fn queued_events_drained_into_prompt() {
        let handler = RecordingHandler::new("CIRCUITS_OK");
        let queue = Arc::new(EventQueue::new());
        queue.enqueue(CIRCUITS_SESSION, "check the deploy", "watcher");
        let r = CircuitsRunner::new(
            Arc::clone(&queue),
            Arc::clone(&handler) as Arc<dyn PollHandler>,
            Duration::from_secs(1800),
            None,
        );
        r.poll_once(12).await;
        let prompts = handler.prompts.lock().unwrap();
        assert!(prompts[0].contains("check the deploy"));
        assert!(prompts[0].contains("[watcher]"));
        assert!(!queue.has(CIRCUITS_SESSION), "queue must be drained");
    }

    #[test]
    fn poll_prompt_carries_quiet_contract() {
        let prompt = build_poll_prompt(&[]);
        assert!(prompt.contains(CIRCUITS_OK_TOKEN));
        assert!(prompt.contains(SILENT_TOKEN));
    }

    #[tokio::test]
    async fn request_now_wakes_the_loop() {
        let handler = RecordingHandler::new("CIRCUITS_OK");
        let r = Arc::new(CircuitsRunner::new(
            Arc::new(EventQueue::new()),
            Arc::clone(&handler) as Arc<dyn PollHandler>,
            // Interval far beyond the test duration: only request_now can
            // trigger the poll.
            Duration::from_secs(3600),
            None,
        ));
        let task = tokio::spawn(Arc::clone(&r).run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.polls.load(Ordering::SeqCst), 0);
        r.request_now();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.polls.load(Ordering::SeqCst), 1);
        task.abort();
    }
}
