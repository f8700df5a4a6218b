// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{provider::ResponseStream, CompletionRequest, ResponseEvent};

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }
    fn supports_vision(&self) -> bool {
        false
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::Role::User))
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();

        let events: Vec<anyhow::Result<ResponseEvent>> = vec![
            Ok(ResponseEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(ResponseEvent::Usage {
                input_tokens: 10,
                output_tokens: 10,
            }),
            Ok(ResponseEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// One scripted completion: either an event sequence or a hard failure
/// message (returned as an `Err` from `complete`).
pub type Script = Result<Vec<ResponseEvent>, String>;

/// A pre-scripted mock provider.  Each `complete` call pops the next script
/// from the front of the queue, so tests can specify exact event sequences —
/// including tool calls and provider failures — without network access.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<Script>>>,
    provider_name: String,
    model: String,
    vision: bool,
    /// The last `CompletionRequest` seen, for assertions on what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
    /// Number of `complete` calls made against this provider.
    pub call_count: Arc<AtomicUsize>,
}

impl ScriptedMockProvider {
    pub fn new(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self::with_scripts(scripts.into_iter().map(Ok).collect())
    }

    pub fn with_scripts(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            provider_name: "scripted-mock".into(),
            model: "scripted-mock-model".into(),
            vision: false,
            last_request: Arc::new(Mutex::new(None)),
            call_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Override the reported provider / model names (cooldown and fallback
    /// tests key on these).
    pub fn with_names(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider_name = provider.into();
        self.model = model.into();
        self
    }

    /// Declare image support so vision-path tests are not re-routed.
    pub fn with_vision(mut self) -> Self {
        self.vision = true;
        self
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![vec![
            ResponseEvent::TextDelta(r),
            ResponseEvent::Usage {
                input_tokens: 5,
                output_tokens: 5,
            },
            ResponseEvent::Done,
        ]])
    }

    /// Convenience: one tool call, then a text reply on the next call.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![
                ResponseEvent::ToolCall {
                    index: 0,
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                ResponseEvent::Done,
            ],
            vec![
                ResponseEvent::TextDelta(final_text.into()),
                ResponseEvent::Done,
            ],
        ])
    }

    /// Convenience: `fail_count` hard failures with `error`, then success.
    pub fn failures_then_text(fail_count: usize, error: &str, final_text: &str) -> Self {
        let mut scripts: Vec<Script> = (0..fail_count).map(|_| Err(error.to_string())).collect();
        scripts.push(Ok(vec![
            ResponseEvent::TextDelta(final_text.to_string()),
            ResponseEvent::Done,
        ]));
        Self::with_scripts(scripts)
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn supports_vision(&self) -> bool {
        self.vision
    }
    fn context_window(&self) -> u32 {
        128_000
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap_or_else(|p| p.into_inner()) = Some(req);
        let script = {
            let mut scripts = self.scripts.lock().unwrap_or_else(|p| p.into_inner());
            if scripts.is_empty() {
                Ok(vec![
                    ResponseEvent::TextDelta("[no more scripts]".into()),
                    ResponseEvent::Done,
                ])
            } else {
                scripts.remove(0)
            }
        };
        match script {
            Ok(events) => {
                let wrapped: Vec<anyhow::Result<ResponseEvent>> =
                    events.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(wrapped)))
            }
            Err(msg) => Err(anyhow::anyhow!(msg)),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
