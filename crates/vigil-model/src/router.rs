// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The model router: one interface over every wire protocol.
//!
//! `call` resolves a model name to a driver, aggregates its event stream
//! into a [`RouterResponse`], and recovers transient failures locally:
//! exponential backoff for retryable classes, provider cooldowns, and
//! traversal of the fallback chain.  Failures the agent loop must act on
//! (`context_overflow`, `format_error`, `content_filter`) are returned
//! immediately with the classification attached instead of burning fallback
//! attempts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use vigil_config::Config;

use crate::{
    catalog,
    failover::{
        classify, is_provider_level, is_retryable, Aborted, CooldownTracker, FailureKind,
        ModelAttempt,
    },
    openai_compat::{AuthStyle, OpenAiCompatProvider},
    AnthropicProvider, CompletionRequest, GoogleProvider, Message, ModelProvider, ResponseEvent,
    Role, ToolCall, ToolSchema,
};

const MAX_ATTEMPTS_PER_MODEL: u32 = 3;

/// Aggregated result of one routed completion.
#[derive(Debug, Clone, Default)]
pub struct RouterResponse {
    pub content: String,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    /// Raw provider part array for this assistant turn (Gemini only).
    pub raw_parts: Option<Value>,
    /// Terminal failure classification; `None` on success.
    pub error: Option<FailureKind>,
    /// Provider / model that produced the response (or the last one tried).
    pub provider: String,
    pub model: String,
    pub attempts: Vec<ModelAttempt>,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl RouterResponse {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }

    fn failed(kind: FailureKind, attempts: Vec<ModelAttempt>, model: &str) -> Self {
        Self {
            error: Some(kind),
            attempts,
            model: model.to_string(),
            ..Default::default()
        }
    }
}

/// Constructs a driver for a model name.  Injectable so tests route to
/// scripted mocks without touching the network.
pub type ProviderFactory =
    dyn Fn(&str) -> anyhow::Result<Arc<dyn ModelProvider>> + Send + Sync;

pub struct ModelRouter {
    config: Arc<Config>,
    cooldowns: CooldownTracker,
    factory: Box<ProviderFactory>,
    backoff_base: Duration,
}

impl ModelRouter {
    pub fn new(config: Arc<Config>) -> Self {
        let cfg = Arc::clone(&config);
        Self {
            config,
            cooldowns: CooldownTracker::new(),
            factory: Box::new(move |model| default_provider(&cfg, model)),
            backoff_base: Duration::from_secs(2),
        }
    }

    /// Build a router with an injected provider factory (tests).
    pub fn with_factory(config: Arc<Config>, factory: Box<ProviderFactory>) -> Self {
        Self {
            config,
            cooldowns: CooldownTracker::new(),
            factory,
            backoff_base: Duration::from_secs(2),
        }
    }

    /// Override the backoff base (tests use milliseconds).
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn cooldowns(&self) -> &CooldownTracker {
        &self.cooldowns
    }

    /// Pick the effective model: the caller's choice unless the request
    /// carries an image and that model cannot see it.
    fn effective_model<'a>(&'a self, messages: &[Message], model: &'a str) -> &'a str {
        let has_images = messages.iter().any(|m| m.has_images());
        if has_images && !catalog::model_supports_vision(model) {
            debug!(
                model,
                fallback = %self.config.vision_fallback_model,
                "request carries images; substituting vision fallback model"
            );
            &self.config.vision_fallback_model
        } else {
            model
        }
    }

    /// Ordered candidate list: the primary, then its provider's fallback
    /// chain (configured or default), deduplicated.
    fn candidates(&self, model: &str) -> Vec<String> {
        let provider = catalog::resolve_provider(model);
        let chain = self
            .config
            .fallback_chains
            .get(provider)
            .cloned()
            .unwrap_or_else(|| catalog::default_fallback_chain(provider));
        let mut out = vec![model.to_string()];
        for m in chain {
            if !out.contains(&m) {
                out.push(m);
            }
        }
        out
    }

    /// One routed completion with retry, cooldowns, and fallback.
    ///
    /// Returns `Err` only for a user abort; every other failure is carried
    /// in `RouterResponse::error`.
    pub async fn call(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        model: &str,
    ) -> anyhow::Result<RouterResponse> {
        // An empty user message is never forwarded to any provider.
        if let Some(last) = messages.iter().rev().find(|m| m.role == Role::User) {
            if last.content.is_empty() {
                return Ok(RouterResponse::failed(
                    FailureKind::FormatError,
                    Vec::new(),
                    model,
                ));
            }
        }

        let model = self.effective_model(messages, model);
        let mut attempts: Vec<ModelAttempt> = Vec::new();
        let mut last_kind = FailureKind::Unknown;

        for candidate in self.candidates(model) {
            let provider = match (self.factory)(&candidate) {
                Ok(p) => p,
                Err(e) => {
                    attempts.push(ModelAttempt {
                        provider: catalog::resolve_provider(&candidate).to_string(),
                        model: candidate.clone(),
                        error: format!("{e:#}"),
                        kind: FailureKind::ModelError,
                        duration_ms: 0,
                    });
                    continue;
                }
            };
            let provider_id = provider.name().to_string();

            // Cool providers are skipped outright — no HTTP attempt.
            if self.cooldowns.is_cool(&provider_id) {
                let reason = self
                    .cooldowns
                    .info(&provider_id)
                    .map(|(d, r)| format!("{r} ({}s remaining)", d.as_secs()))
                    .unwrap_or_else(|| "cooldown".into());
                debug!(provider = %provider_id, model = %candidate, %reason, "skipping cool provider");
                attempts.push(ModelAttempt {
                    provider: provider_id,
                    model: candidate,
                    error: format!("provider in cooldown ({reason})"),
                    kind: FailureKind::RateLimit,
                    duration_ms: 0,
                });
                continue;
            }

            let req = CompletionRequest {
                messages: messages.to_vec(),
                tools: tools.to_vec(),
                stream: true,
            };

            for attempt in 1..=MAX_ATTEMPTS_PER_MODEL {
                let started = Instant::now();
                match self.run_once(provider.as_ref(), req.clone()).await {
                    Ok(mut resp) => {
                        self.cooldowns.clear(&provider_id);
                        resp.provider = provider_id;
                        resp.model = candidate;
                        resp.attempts = attempts;
                        return Ok(resp);
                    }
                    Err(e) => {
                        if e.downcast_ref::<Aborted>().is_some() {
                            return Err(e);
                        }
                        let kind = classify(&e);
                        last_kind = kind;
                        warn!(
                            provider = %provider_id,
                            model = %candidate,
                            %kind,
                            attempt,
                            error = %format!("{e:#}").chars().take(200).collect::<String>(),
                            "model call failed"
                        );
                        attempts.push(ModelAttempt {
                            provider: provider_id.clone(),
                            model: candidate.clone(),
                            error: format!("{e:#}").chars().take(500).collect(),
                            kind,
                            duration_ms: started.elapsed().as_millis() as u64,
                        });

                        if is_provider_level(kind) {
                            self.cooldowns.enter(&provider_id, kind, &candidate);
                        }

                        // Failures the agent loop handles itself bubble up
                        // immediately with the classification attached.
                        if matches!(
                            kind,
                            FailureKind::ContextOverflow
                                | FailureKind::FormatError
                                | FailureKind::ContentFilter
                        ) {
                            return Ok(RouterResponse::failed(kind, attempts, &candidate));
                        }

                        if is_retryable(kind) && attempt < MAX_ATTEMPTS_PER_MODEL {
                            let delay = self.backoff_base * 2u32.pow(attempt - 1);
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        break;
                    }
                }
            }
        }

        Ok(RouterResponse::failed(last_kind, attempts, model))
    }

    /// Raw streaming access to the effective provider (no retry/fallback).
    pub async fn stream(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        model: &str,
    ) -> anyhow::Result<crate::provider::ResponseStream> {
        let model = self.effective_model(messages, model);
        let provider = (self.factory)(model)?;
        provider
            .complete(CompletionRequest {
                messages: messages.to_vec(),
                tools: tools.to_vec(),
                stream: true,
            })
            .await
    }

    /// Drive one provider stream to completion, aggregating events.
    async fn run_once(
        &self,
        provider: &dyn ModelProvider,
        req: CompletionRequest,
    ) -> anyhow::Result<RouterResponse> {
        use futures::StreamExt;

        let mut stream = provider.complete(req).await?;

        let mut content = String::new();
        let mut thinking = String::new();
        // Keyed by the provider's parallel-tool-call index; OpenAI interleaves
        // argument chunks for different calls by index.
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
        let mut raw_parts: Vec<Value> = Vec::new();
        let mut input_tokens = 0u32;
        let mut output_tokens = 0u32;

        while let Some(event) = stream.next().await {
            match event? {
                ResponseEvent::TextDelta(t) => content.push_str(&t),
                ResponseEvent::ThinkingDelta(t) => thinking.push_str(&t),
                ResponseEvent::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                } => {
                    let entry = pending.entry(index).or_default();
                    if !id.is_empty() {
                        entry.id = id;
                    }
                    if !name.is_empty() {
                        entry.name = name;
                    }
                    entry.args_buf.push_str(&arguments);
                }
                ResponseEvent::RawParts(part) => raw_parts.push(part),
                ResponseEvent::Usage {
                    input_tokens: i,
                    output_tokens: o,
                } => {
                    input_tokens = input_tokens.max(i);
                    output_tokens = output_tokens.max(o);
                }
                ResponseEvent::MaxTokens => {}
                ResponseEvent::Done => break,
                ResponseEvent::Error(e) => warn!("model stream error: {e}"),
            }
        }

        // Flush accumulated tool calls ordered by index.  Calls with an
        // empty name cannot be dispatched and are dropped; an empty id gets
        // a synthetic fallback so the turn still completes.
        let mut ordered: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
        ordered.sort_by_key(|(idx, _)| *idx);
        let mut tool_calls = Vec::new();
        for (i, (_, p)) in ordered.into_iter().enumerate() {
            if p.name.is_empty() {
                warn!(tool_call_id = %p.id, "dropping tool call with empty name from model");
                continue;
            }
            let mut tc = p.finish();
            if tc.id.is_empty() {
                tc.id = format!("tc_synthetic_{i}");
            }
            tool_calls.push(tc);
        }

        Ok(RouterResponse {
            content,
            thinking: if thinking.is_empty() {
                None
            } else {
                Some(thinking)
            },
            tool_calls,
            raw_parts: if raw_parts.is_empty() {
                None
            } else {
                Some(Value::Array(raw_parts))
            },
            error: None,
            provider: String::new(),
            model: String::new(),
            attempts: Vec::new(),
            input_tokens,
            output_tokens,
        })
    }
}

/// Build the real driver for a model name.
fn default_provider(config: &Config, model: &str) -> anyhow::Result<Arc<dyn ModelProvider>> {
    let provider = catalog::resolve_provider(model);
    let key = config.api_key_for(provider);
    let max_tokens = config.max_tokens;
    let temperature = config.temperature;
    let boxed: Arc<dyn ModelProvider> = match provider {
        "openai" => Arc::new(OpenAiCompatProvider::new(
            "openai",
            model.to_string(),
            key,
            "https://api.openai.com/v1",
            max_tokens,
            temperature,
            AuthStyle::Bearer,
        )),
        "xai" => Arc::new(OpenAiCompatProvider::new(
            "xai",
            model.to_string(),
            key,
            "https://api.x.ai/v1",
            max_tokens,
            temperature,
            AuthStyle::Bearer,
        )),
        "anthropic" => Arc::new(AnthropicProvider::new(
            model.to_string(),
            key,
            None,
            max_tokens,
            temperature,
        )),
        "google" => Arc::new(GoogleProvider::new(
            model.to_string(),
            key,
            None,
            max_tokens,
            temperature,
        )),
        _ => Arc::new(OpenAiCompatProvider::new(
            "ollama",
            model.to_string(),
            None,
            "http://localhost:11434/v1",
            max_tokens,
            temperature,
            AuthStyle::None,
        )),
    };
    Ok(boxed)
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    /// Resolve the accumulated argument buffer to a JSON object.
    ///
    /// Providers (notably Anthropic) require tool input to be an object;
    /// substituting `{}` for unparseable arguments keeps the conversation
    /// history valid for the next request.
    fn finish(self) -> ToolCall {
        let arguments = if self.args_buf.is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(_) => match repair_json(&self.args_buf) {
                    Some(v) => {
                        warn!(tool_name = %self.name, "repaired invalid JSON arguments from model");
                        v
                    }
                    None => {
                        warn!(
                            tool_name = %self.name,
                            args = %self.args_buf.chars().take(200).collect::<String>(),
                            "model sent unparseable tool arguments; substituting {{}}"
                        );
                        Value::Object(Default::default())
                    }
                },
            }
        };
        ToolCall {
            id: self.id,
            name: self.name,
            arguments,
        }
    }
}

/// Attempt to repair common JSON syntax errors from streamed tool arguments:
/// invalid escape sequences inside strings, and truncated output missing a
/// closing quote/brace.
fn repair_json(raw: &str) -> Option<Value> {
    let fixed = fix_invalid_escapes(raw);
    if let Ok(v) = serde_json::from_str(&fixed) {
        return Some(v);
    }
    if !fixed.trim_end().ends_with('}') {
        let mut completed = fixed;
        if completed.chars().filter(|&c| c == '"').count() % 2 == 1 {
            completed.push('"');
        }
        completed.push('}');
        if let Ok(v) = serde_json::from_str(&completed) {
            return Some(v);
        }
    }
    None
}

/// Replace invalid escape sequences inside JSON string values with an
/// escaped backslash so serde can parse the result.
fn fix_invalid_escapes(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 8);
    let mut chars = raw.chars();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next)
                        if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') =>
                    {
                        out.push('\\');
                        out.push(next);
                    }
                    Some(next) => {
                        out.push('\\');
                        out.push('\\');
                        out.push(next);
                    }
                    None => out.push('\\'),
                },
                '"' => {
                    in_string = false;
                    out.push('"');
                }
                _ => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
