// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    provider::ResponseStream, sanitize::clean_tool_schema, CompletionRequest, ContentPart,
    Message, MessageContent, ResponseEvent, Role,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Thinking budget for extended-thinking models.
const THINKING_BUDGET_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            max_tokens,
            temperature,
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Claude 3.7 and the 4.x families take the extended-thinking block.
    fn supports_extended_thinking(&self) -> bool {
        let m = self.model.as_str();
        m.starts_with("claude-3-7")
            || m.starts_with("claude-4")
            || m.starts_with("claude-opus-4")
            || m.starts_with("claude-sonnet-4")
            || m.starts_with("claude-haiku-4")
    }
}

#[async_trait]
impl crate::ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let key = self
            .api_key
            .as_deref()
            .context("ANTHROPIC_API_KEY not set")?;

        let (system_text, messages) = build_anthropic_messages(&req.messages);

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": clean_tool_schema(&t.parameters),
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "stream": req.stream,
        });
        // Extended thinking forces temperature = 1 and forbids top_p / top_k.
        if self.supports_extended_thinking() {
            body["thinking"] = json!({
                "type": "enabled",
                "budget_tokens": THINKING_BUDGET_TOKENS,
            });
            body["temperature"] = json!(1);
        } else {
            body["temperature"] = json!(self.temperature);
        }
        if !system_text.is_empty() {
            body["system"] = json!(system_text);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(model = %self.model, message_count = messages.len(), "sending anthropic request");

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .context("Anthropic request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("anthropic error {status}: {text}");
        }

        let byte_stream = resp.bytes_stream();
        // SSE lines can split across TCP chunks; carry a remainder buffer.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let text = match chunk {
                    Ok(b) => String::from_utf8_lossy(&b).to_string(),
                    Err(e) => {
                        return futures::future::ready(Some(vec![Err(anyhow::anyhow!(e))]));
                    }
                };
                buf.push_str(&text);
                let mut events = Vec::new();
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                            events.push(parse_anthropic_event(&v));
                        }
                    }
                }
                futures::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

pub(crate) fn parse_anthropic_event(v: &Value) -> anyhow::Result<ResponseEvent> {
    match v["type"].as_str().unwrap_or("") {
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => Ok(ResponseEvent::TextDelta(
                    delta["text"].as_str().unwrap_or("").to_string(),
                )),
                "input_json_delta" => Ok(ResponseEvent::ToolCall {
                    index,
                    id: String::new(),
                    name: String::new(),
                    arguments: delta["partial_json"].as_str().unwrap_or("").to_string(),
                }),
                "thinking_delta" => {
                    let thinking = delta["thinking"].as_str().unwrap_or("");
                    if thinking.is_empty() {
                        Ok(ResponseEvent::TextDelta(String::new()))
                    } else {
                        Ok(ResponseEvent::ThinkingDelta(thinking.to_string()))
                    }
                }
                // The signature blob that closes a thinking block is not
                // human-readable and must never surface as text.
                "signature_delta" => Ok(ResponseEvent::TextDelta(String::new())),
                _ => Ok(ResponseEvent::TextDelta(String::new())),
            }
        }
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let block = &v["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                Ok(ResponseEvent::ToolCall {
                    index,
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    arguments: String::new(),
                })
            } else {
                Ok(ResponseEvent::TextDelta(String::new()))
            }
        }
        "message_delta" => {
            if v["delta"]["stop_reason"].as_str() == Some("max_tokens") {
                return Ok(ResponseEvent::MaxTokens);
            }
            if let Some(usage) = v.get("usage") {
                return Ok(ResponseEvent::Usage {
                    input_tokens: 0,
                    output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
                });
            }
            Ok(ResponseEvent::TextDelta(String::new()))
        }
        "message_start" => {
            if let Some(usage) = v["message"].get("usage") {
                return Ok(ResponseEvent::Usage {
                    input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                    output_tokens: 0,
                });
            }
            Ok(ResponseEvent::TextDelta(String::new()))
        }
        "message_stop" => Ok(ResponseEvent::Done),
        _ => Ok(ResponseEvent::TextDelta(String::new())),
    }
}

fn image_block(media_type: &str, data: &str) -> Value {
    json!({
        "type": "image",
        "source": { "type": "base64", "media_type": media_type, "data": data }
    })
}

/// Convert canonical messages into the Anthropic wire format.
///
/// Returns `(system_text, conversation)`.  The FIRST system message becomes
/// the top-level `system` field; any later system message becomes a user
/// turn prefixed "[System note]" so mid-conversation notes survive without
/// violating Anthropic's single-system constraint.  User messages with empty
/// content are dropped.
pub(crate) fn build_anthropic_messages(messages: &[Message]) -> (String, Vec<Value>) {
    let mut system_text = String::new();
    let mut out: Vec<Value> = Vec::new();

    for m in messages {
        if m.role == Role::System {
            if let Some(t) = m.as_text() {
                if system_text.is_empty() {
                    system_text = t.to_string();
                } else {
                    out.push(json!({
                        "role": "user",
                        "content": format!("[System note] {t}"),
                    }));
                }
            }
            continue;
        }

        if m.role == Role::Tool {
            out.push(json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": m.tool_call_id.clone().unwrap_or_default(),
                    "content": m.as_text().unwrap_or(""),
                }]
            }));
            continue;
        }

        if !m.tool_calls.is_empty() {
            let mut blocks: Vec<Value> = Vec::new();
            if let Some(t) = m.as_text() {
                if !t.is_empty() {
                    blocks.push(json!({ "type": "text", "text": t }));
                }
            }
            for tc in &m.tool_calls {
                blocks.push(json!({
                    "type": "tool_use",
                    "id": tc.id,
                    "name": tc.name,
                    "input": tc.arguments,
                }));
            }
            out.push(json!({ "role": "assistant", "content": blocks }));
            continue;
        }

        let role = match m.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            _ => unreachable!(),
        };
        match &m.content {
            MessageContent::Text(t) => {
                // Anthropic rejects empty user content.
                if m.role == Role::User && t.is_empty() {
                    continue;
                }
                out.push(json!({ "role": role, "content": t }));
            }
            MessageContent::Parts(parts) if !parts.is_empty() => {
                let content: Vec<Value> = parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                        ContentPart::Image { media_type, data } => image_block(media_type, data),
                    })
                    .collect();
                out.push(json!({ "role": role, "content": content }));
            }
            MessageContent::Parts(_) => {
                if m.role != Role::User {
                    out.push(json!({ "role": role, "content": "" }));
                }
            }
        }
    }
    (system_text, out)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
