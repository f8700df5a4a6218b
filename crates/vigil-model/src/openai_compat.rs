// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared driver for OpenAI-style chat completion APIs.
//!
//! OpenAI, xAI, and local Ollama all speak the same `/chat/completions` SSE
//! wire format; one `OpenAiCompatProvider` covers them, configured with the
//! provider's endpoint and auth style.
//!
//! # Auth styles
//! - `Bearer` — `Authorization: Bearer <key>` (OpenAI, xAI)
//! - `None` — no authentication (local Ollama)

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    provider::ResponseStream, sanitize::clean_tool_schema, CompletionRequest, Message,
    MessageContent, ResponseEvent, Role,
};

/// Per-provider HTTP timeout for a single completion request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// How to send the API key in HTTP requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    Bearer,
    None,
}

pub struct OpenAiCompatProvider {
    driver_name: &'static str,
    model: String,
    api_key: Option<String>,
    chat_url: String,
    max_tokens: u32,
    temperature: f32,
    auth_style: AuthStyle,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: u32,
        temperature: f32,
        auth_style: AuthStyle,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name,
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            max_tokens,
            temperature,
            auth_style,
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        self.driver_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let messages = build_openai_messages(&req.messages);

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": clean_tool_schema(&t.parameters),
                    }
                })
            })
            .collect();

        // OpenAI's newer models take "max_completion_tokens"; every other
        // compatible server still expects "max_tokens".
        let max_tokens_key = if self.driver_name == "openai" {
            "max_completion_tokens"
        } else {
            "max_tokens"
        };
        // Reasoning models reject an explicit temperature.
        let use_temperature = !(self.driver_name == "openai"
            && (self.model.starts_with("o1-")
                || self.model.starts_with("o3-")
                || self.model.starts_with("o4-")));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": req.stream,
            max_tokens_key: self.max_tokens,
            "stream_options": { "include_usage": true },
        });
        if use_temperature {
            body["temperature"] = json!(self.temperature);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }

        debug!(
            driver = %self.driver_name,
            model = %self.model,
            tool_count = tools.len(),
            message_count = messages.len(),
            "sending completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        if self.auth_style == AuthStyle::Bearer {
            let key = self
                .api_key
                .as_deref()
                .with_context(|| format!("{} API key not set", self.driver_name))?;
            http_req = http_req.bearer_auth(key);
        }

        let resp = http_req
            .send()
            .await
            .with_context(|| format!("{} request failed", self.driver_name))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.driver_name);
        }

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across TCP packets.  Maintain a line buffer
        // across chunks; emit events only for complete lines.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<ResponseEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Drain all complete `\n`-terminated SSE lines from `buf`, leaving any
/// trailing incomplete line for the next TCP chunk.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<ResponseEvent>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

/// Parse one complete SSE `data:` line; `None` for blanks and comments.
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<ResponseEvent>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ResponseEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    Some(parse_sse_chunk(&v))
}

pub(crate) fn parse_sse_chunk(v: &Value) -> anyhow::Result<ResponseEvent> {
    // Usage-only chunk (stream_options.include_usage).
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return Ok(ResponseEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        });
    }

    let choice = &v["choices"][0];

    if choice["finish_reason"].as_str() == Some("length") {
        return Ok(ResponseEvent::MaxTokens);
    }

    let delta = &choice["delta"];

    // Tool call delta — parallel calls are keyed by "index".
    if let Some(tool_calls) = delta.get("tool_calls") {
        if let Some(tc) = tool_calls.get(0) {
            let index = tc["index"].as_u64().unwrap_or(0) as u32;
            let id = tc["id"].as_str().unwrap_or("").to_string();
            let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
            let args = tc["function"]["arguments"].as_str().unwrap_or("").to_string();
            return Ok(ResponseEvent::ToolCall {
                index,
                id,
                name,
                arguments: args,
            });
        }
    }

    // Thinking delta — `reasoning_content` (llama.cpp, DeepSeek, Grok) or
    // `reasoning` (some aggregators).
    let thinking = delta
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
    if let Some(t) = thinking {
        if !t.is_empty() {
            return Ok(ResponseEvent::ThinkingDelta(t.to_string()));
        }
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        return Ok(ResponseEvent::TextDelta(text.to_string()));
    }

    Ok(ResponseEvent::TextDelta(String::new()))
}

fn role_str(r: &Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Convert canonical messages into the OpenAI wire-format JSON array.
///
/// Tool calls ride on the assistant message as a `tool_calls` array; tool
/// results become `role: tool` entries with `tool_call_id`.
pub(crate) fn build_openai_messages(messages: &[Message]) -> Vec<Value> {
    use crate::ContentPart;

    let mut out: Vec<Value> = Vec::with_capacity(messages.len());

    for m in messages {
        if m.role == Role::Tool {
            out.push(json!({
                "role": "tool",
                "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
                "content": match m.as_text() { Some(t) => t.to_string(), None => String::new() },
            }));
            continue;
        }

        if !m.tool_calls.is_empty() {
            let calls: Vec<Value> = m
                .tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments.to_string(),
                        }
                    })
                })
                .collect();
            let mut msg = json!({ "role": "assistant", "tool_calls": calls });
            if let Some(t) = m.as_text() {
                if !t.is_empty() {
                    msg["content"] = json!(t);
                }
            }
            out.push(msg);
            continue;
        }

        let v = match &m.content {
            MessageContent::Text(t) => json!({ "role": role_str(&m.role), "content": t }),
            MessageContent::Parts(parts) if !parts.is_empty() => {
                let content: Vec<Value> = parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                        ContentPart::Image { .. } => json!({
                            "type": "image_url",
                            "image_url": { "url": p.as_data_url().unwrap_or_default() },
                        }),
                    })
                    .collect();
                json!({ "role": role_str(&m.role), "content": content })
            }
            MessageContent::Parts(_) => json!({ "role": role_str(&m.role), "content": "" }),
        };
        out.push(v);
    }

    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
