// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Google Gemini driver — native Generative Language API.
//!
//! Uses the `streamGenerateContent` endpoint with SSE framing.  Supports
//! text, tool calls, thinking deltas via `thought` parts, and verbatim
//! echo-back of assistant tool-call turns (Gemini 3+ rejects a request when
//! the `thoughtSignature` tokens it emitted are missing from the replayed
//! turn).
//!
//! # Auth
//! API key via `?key=...` query param.

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

pub struct GoogleProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl GoogleProvider {
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
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
            max_tokens,
            temperature,
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let key = self.api_key.as_deref().context("GEMINI_API_KEY not set")?;

        let (system_instruction, contents) = build_gemini_contents(&req.messages);

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": self.max_tokens,
                "temperature": self.temperature,
            }
        });
        if let Some(sys) = system_instruction {
            body["systemInstruction"] = sys;
        }
        if !req.tools.is_empty() {
            let function_declarations: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": clean_tool_schema(&t.parameters),
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": function_declarations }]);
        }

        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url.trim_end_matches('/'),
            self.model,
            key
        );

        debug!(model = %self.model, "sending Google Gemini request");

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Google Gemini request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("google error {status}: {text}");
        }

        let byte_stream = resp.bytes_stream();
        // scan state: (line buffer, running functionCall counter).  The
        // counter gives parallel tool calls distinct synthetic ids — Gemini
        // matches responses by function name and carries no call id.
        let event_stream = byte_stream
            .scan((String::new(), 0u32), |(buf, tc_count), chunk| {
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
                        let data = data.trim();
                        if data == "[DONE]" {
                            events.push(Ok(ResponseEvent::Done));
                        } else if let Ok(v) = serde_json::from_str::<Value>(data) {
                            events.extend(parse_gemini_chunk(&v, tc_count).into_iter().map(Ok));
                        }
                    }
                }
                futures::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Parse one streamed Gemini chunk into zero or more events.
///
/// `tc_count` is the running parallel-tool-call counter, incremented for
/// every functionCall part so synthetic call ids stay unique.
pub(crate) fn parse_gemini_chunk(v: &Value, tc_count: &mut u32) -> Vec<ResponseEvent> {
    let mut events = Vec::new();

    if let Some(meta) = v.get("usageMetadata") {
        events.push(ResponseEvent::Usage {
            input_tokens: meta["promptTokenCount"].as_u64().unwrap_or(0) as u32,
            output_tokens: meta["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
        });
    }

    let candidate = &v["candidates"][0];
    let parts = match candidate["content"]["parts"].as_array() {
        Some(p) => p,
        None => {
            if candidate["finishReason"].as_str().is_some() {
                events.push(ResponseEvent::Done);
            }
            return events;
        }
    };

    for part in parts {
        if part.get("thought").and_then(|t| t.as_bool()) == Some(true) {
            if let Some(text) = part["text"].as_str() {
                events.push(ResponseEvent::ThinkingDelta(text.to_string()));
            }
            continue;
        }
        if let Some(fc) = part.get("functionCall") {
            let index = *tc_count;
            *tc_count += 1;
            let name = fc["name"].as_str().unwrap_or("").to_string();
            let args = serde_json::to_string(&fc["args"]).unwrap_or_default();
            events.push(ResponseEvent::ToolCall {
                index,
                id: format!("{name}-{index}"),
                name,
                arguments: args,
            });
            // Preserve the raw part (including any thoughtSignature) so the
            // turn can be echoed back verbatim on the next request.
            events.push(ResponseEvent::RawParts(part.clone()));
            continue;
        }
        if let Some(text) = part["text"].as_str() {
            events.push(ResponseEvent::TextDelta(text.to_string()));
        }
    }

    if candidate["finishReason"].as_str().is_some() {
        events.push(ResponseEvent::Done);
    }
    events
}

fn gemini_role(role: &Role) -> &'static str {
    match role {
        Role::Assistant => "model",
        _ => "user",
    }
}

/// Convert canonical messages into `(systemInstruction, contents)`.
///
/// Only the FIRST system message becomes `systemInstruction`; later ones
/// become "[System note]" user turns.  Consecutive same-role turns are
/// merged (Gemini rejects alternating-role violations) and the conversation
/// is forced to start with a user turn.  An assistant turn carrying
/// `raw_parts` is replayed exactly as captured, never merged.
pub(crate) fn build_gemini_contents(messages: &[Message]) -> (Option<Value>, Vec<Value>) {
    let mut system_instruction: Option<Value> = None;
    // (role, parts, frozen) — frozen turns carry raw provider parts.
    let mut turns: Vec<(&'static str, Vec<Value>, bool)> = Vec::new();

    let mut push_parts = |role: &'static str, parts: Vec<Value>, frozen: bool| {
        if frozen {
            turns.push((role, parts, true));
            return;
        }
        match turns.last_mut() {
            Some((last_role, last_parts, false)) if *last_role == role => {
                last_parts.extend(parts);
            }
            _ => turns.push((role, parts, false)),
        }
    };

    for m in messages {
        match m.role {
            Role::System => {
                if let Some(t) = m.as_text() {
                    if system_instruction.is_none() {
                        system_instruction = Some(json!({ "parts": [{ "text": t }] }));
                    } else {
                        push_parts("user", vec![json!({ "text": format!("[System note] {t}") })], false);
                    }
                }
            }
            Role::Tool => {
                // Gemini matches a functionResponse to its call by NAME.
                let fn_name = m
                    .name
                    .clone()
                    .or_else(|| m.tool_call_id.clone())
                    .unwrap_or_default();
                push_parts(
                    "user",
                    vec![json!({
                        "functionResponse": {
                            "name": fn_name,
                            "response": { "result": m.as_text().unwrap_or("") },
                        }
                    })],
                    false,
                );
            }
            Role::Assistant if !m.tool_calls.is_empty() => {
                if let Some(raw) = &m.raw_parts {
                    let parts = raw.as_array().cloned().unwrap_or_else(|| vec![raw.clone()]);
                    push_parts("model", parts, true);
                } else {
                    let mut parts: Vec<Value> = Vec::new();
                    if let Some(t) = m.as_text() {
                        if !t.is_empty() {
                            parts.push(json!({ "text": t }));
                        }
                    }
                    for tc in &m.tool_calls {
                        parts.push(json!({
                            "functionCall": { "name": tc.name, "args": tc.arguments }
                        }));
                    }
                    push_parts("model", parts, false);
                }
            }
            Role::User | Role::Assistant => {
                let parts: Vec<Value> = match &m.content {
                    MessageContent::Text(t) => {
                        if t.is_empty() {
                            continue;
                        }
                        vec![json!({ "text": t })]
                    }
                    MessageContent::Parts(parts) => parts
                        .iter()
                        .map(|p| match p {
                            ContentPart::Text { text } => json!({ "text": text }),
                            ContentPart::Image { media_type, data } => json!({
                                "inline_data": { "mime_type": media_type, "data": data }
                            }),
                        })
                        .collect(),
                };
                if !parts.is_empty() {
                    push_parts(gemini_role(&m.role), parts, false);
                }
            }
        }
    }

    // The conversation must open with a user turn.
    if turns.first().map(|(r, _, _)| *r) != Some("user") {
        turns.insert(0, ("user", vec![json!({ "text": "(start)" })], false));
    }

    let contents = turns
        .into_iter()
        .map(|(role, parts, _)| json!({ "role": role, "parts": parts }))
        .collect();
    (system_instruction, contents)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ModelProvider, ToolCall};

    #[test]
    fn provider_name_and_model() {
        let p = GoogleProvider::new("gemini-2.5-flash".into(), None, None, 8192, 0.7);
        assert_eq!(p.name(), "google");
        assert_eq!(p.model_name(), "gemini-2.5-flash");
    }

    // ── Chunk parsing ─────────────────────────────────────────────────────────

    #[test]
    fn text_delta_parsed() {
        let v = json!({ "candidates": [{ "content": { "parts": [{ "text": "hello" }] } }] });
        let mut n = 0;
        let events = parse_gemini_chunk(&v, &mut n);
        assert!(matches!(&events[0], ResponseEvent::TextDelta(t) if t == "hello"));
    }

    #[test]
    fn thought_part_is_thinking() {
        let v = json!({
            "candidates": [{ "content": { "parts": [{ "text": "mulling", "thought": true }] } }]
        });
        let mut n = 0;
        let events = parse_gemini_chunk(&v, &mut n);
        assert!(matches!(&events[0], ResponseEvent::ThinkingDelta(t) if t == "mulling"));
    }

    #[test]
    fn function_call_emits_tool_call_and_raw_part() {
        let v = json!({
            "candidates": [{
                "content": {
                    "parts": [{
                        "functionCall": { "name": "bash", "args": { "command": "ls" } },
                        "thoughtSignature": "opaque-token"
                    }]
                }
            }]
        });
        let mut n = 0;
        let events = parse_gemini_chunk(&v, &mut n);
        assert!(matches!(&events[0], ResponseEvent::ToolCall { name, id, .. }
            if name == "bash" && id == "bash-0"));
        match &events[1] {
            ResponseEvent::RawParts(raw) => {
                assert_eq!(raw["thoughtSignature"], "opaque-token");
            }
            other => panic!("expected RawParts, got {other:?}"),
        }
        assert_eq!(n, 1, "counter advances per functionCall");
    }

    #[test]
    fn parallel_function_calls_get_distinct_ids() {
        let v = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "functionCall": { "name": "bash", "args": {} } },
                        { "functionCall": { "name": "bash", "args": {} } }
                    ]
                }
            }]
        });
        let mut n = 0;
        let events = parse_gemini_chunk(&v, &mut n);
        let ids: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ResponseEvent::ToolCall { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["bash-0", "bash-1"]);
    }

    #[test]
    fn usage_metadata_parsed() {
        let v = json!({
            "usageMetadata": { "promptTokenCount": 100, "candidatesTokenCount": 50 },
            "candidates": [{}]
        });
        let mut n = 0;
        let events = parse_gemini_chunk(&v, &mut n);
        assert!(matches!(events[0], ResponseEvent::Usage { input_tokens: 100, output_tokens: 50 }));
    }

    #[test]
    fn finish_reason_without_parts_is_done() {
        let v = json!({ "candidates": [{ "finishReason": "STOP" }] });
        let mut n = 0;
        let events = parse_gemini_chunk(&v, &mut n);
        assert!(matches!(events[0], ResponseEvent::Done));
    }

    // ── Content building ──────────────────────────────────────────────────────

    #[test]
    fn first_system_becomes_system_instruction() {
        let (sys, contents) =
            build_gemini_contents(&[Message::system("be good"), Message::user("hi")]);
        assert_eq!(sys.unwrap()["parts"][0]["text"], "be good");
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["role"], "user");
    }

    #[test]
    fn later_system_becomes_system_note() {
        let (_, contents) = build_gemini_contents(&[
            Message::system("primary"),
            Message::user("hi"),
            Message::system("note"),
        ]);
        // "hi" and "[System note] note" merge into one user turn.
        assert_eq!(contents.len(), 1);
        let parts = contents[0]["parts"].as_array().unwrap();
        assert_eq!(parts[0]["text"], "hi");
        assert_eq!(parts[1]["text"], "[System note] note");
    }

    #[test]
    fn conversation_must_start_with_user_turn() {
        let (_, contents) = build_gemini_contents(&[Message::assistant("I begin")]);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"][0]["text"], "(start)");
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn consecutive_same_role_turns_are_merged() {
        let (_, contents) = build_gemini_contents(&[
            Message::user("one"),
            Message::user("two"),
            Message::assistant("three"),
        ]);
        assert_eq!(contents.len(), 2);
        let user_parts = contents[0]["parts"].as_array().unwrap();
        assert_eq!(user_parts.len(), 2);
    }

    #[test]
    fn tool_result_uses_function_name_not_call_id() {
        let (_, contents) = build_gemini_contents(&[
            Message::user("run it"),
            Message::tool_result("bash-0", "bash", "file.txt"),
        ]);
        let parts = contents.last().unwrap()["parts"].as_array().unwrap();
        let fr = &parts.last().unwrap()["functionResponse"];
        assert_eq!(fr["name"], "bash");
        assert_eq!(fr["response"]["result"], "file.txt");
    }

    #[test]
    fn assistant_tool_call_without_raw_parts_builds_function_call() {
        let msg = Message::assistant_with_tool_calls(
            "",
            vec![ToolCall {
                id: "bash-0".into(),
                name: "bash".into(),
                arguments: json!({"command": "ls"}),
            }],
        );
        let (_, contents) = build_gemini_contents(&[Message::user("go"), msg]);
        let parts = contents[1]["parts"].as_array().unwrap();
        assert_eq!(parts[0]["functionCall"]["name"], "bash");
        assert_eq!(parts[0]["functionCall"]["args"]["command"], "ls");
    }

    #[test]
    fn raw_parts_are_echoed_back_verbatim() {
        let raw = json!([{
            "functionCall": { "name": "bash", "args": { "command": "ls" } },
            "thoughtSignature": "sig-abc123"
        }]);
        let mut msg = Message::assistant_with_tool_calls(
            "",
            vec![ToolCall {
                id: "bash-0".into(),
                name: "bash".into(),
                arguments: json!({"command": "ls"}),
            }],
        );
        msg.raw_parts = Some(raw.clone());
        let (_, contents) = build_gemini_contents(&[
            Message::user("go"),
            msg,
            Message::tool_result("bash-0", "bash", "ok"),
        ]);
        assert_eq!(
            contents[1]["parts"], raw,
            "captured raw part array must be replayed byte-for-byte"
        );
    }

    #[test]
    fn raw_parts_turn_is_never_merged_with_neighbors() {
        let mut tc_msg = Message::assistant_with_tool_calls(
            "",
            vec![ToolCall { id: "t-0".into(), name: "t".into(), arguments: json!({}) }],
        );
        tc_msg.raw_parts = Some(json!([{ "functionCall": { "name": "t", "args": {} } }]));
        let (_, contents) = build_gemini_contents(&[
            Message::user("go"),
            Message::assistant("preamble"),
            tc_msg,
        ]);
        // "preamble" stays its own model turn; the raw turn follows untouched.
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["parts"][0]["text"], "preamble");
        assert_eq!(contents[2]["parts"][0]["functionCall"]["name"], "t");
    }

    #[test]
    fn image_parts_become_inline_data() {
        let msg = Message::user_with_parts(vec![
            ContentPart::text("look"),
            ContentPart::image("image/png", "abc="),
        ]);
        let (_, contents) = build_gemini_contents(&[msg]);
        let parts = contents[0]["parts"].as_array().unwrap();
        assert_eq!(parts[1]["inline_data"]["mime_type"], "image/png");
        assert_eq!(parts[1]["inline_data"]["data"], "abc=");
    }

    #[test]
    fn pure_text_round_trip_preserves_role_text_pairs() {
        let original = vec![
            Message::user("one"),
            Message::assistant("two"),
            Message::user("three"),
        ];
        let (_, wire) = build_gemini_contents(&original);
        let rebuilt: Vec<(Role, String)> = wire
            .iter()
            .map(|turn| {
                let role = if turn["role"] == "model" {
                    Role::Assistant
                } else {
                    Role::User
                };
                (role, turn["parts"][0]["text"].as_str().unwrap().to_string())
            })
            .collect();
        let expected: Vec<(Role, String)> = original
            .iter()
            .map(|m| (m.role.clone(), m.as_text().unwrap().to_string()))
            .collect();
        assert_eq!(rebuilt, expected);
    }
}
