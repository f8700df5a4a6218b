// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context compaction: keep the conversation within a token budget without
//! losing the thread.
//!
//! The strategy is lazy and staged.  All system messages and the most
//! recent tail are preserved verbatim; the older prefix is pruned by
//! repeatedly dropping its oldest token-share chunk; dropped messages are
//! summarized via the (optional) LLM-backed summarizer into one synthetic
//! system message — in stages when the prefix is long — with a progressive
//! fallback down to a plain-text digest when summarization fails.

use async_trait::async_trait;
use tracing::{debug, warn};

use vigil_model::{Message, MessageContent, Role};

/// Default number of trailing messages preserved verbatim.
pub const DEFAULT_PRESERVE_RECENT: usize = 10;

/// Tokens reserved for the summary's own share of the budget.
const SUMMARY_RESERVE_TOKENS: usize = 600;

/// Staged summarization: number of parts the dropped prefix is split into.
const SUMMARY_STAGES: usize = 2;

/// Adaptive chunk sizing bounds (fractions of the context window).
const BASE_CHUNK_RATIO: f32 = 0.40;
const MIN_CHUNK_RATIO: f32 = 0.15;
/// Buffer for estimation inaccuracy.
const SAFETY_MARGIN: f32 = 1.2;

/// Messages above this share of the context window are excluded from
/// summarization by the progressive fallback.
const OVERSIZED_SHARE: f32 = 0.5;

/// Basic-summary shape: last N dropped messages, first M chars each.
const BASIC_SUMMARY_MESSAGES: usize = 8;
const BASIC_SUMMARY_CHARS: usize = 200;

const SUMMARIZE_INSTRUCTIONS: &str =
    "Summarise this conversation segment in a concise, information-dense way. \
     Preserve decisions, file names, tool outputs, and open questions that matter \
     for continuing the work.";

const MERGE_INSTRUCTIONS: &str =
    "Merge these partial summaries into a single cohesive summary. \
     Preserve decisions, TODOs, open questions, and any constraints.";

/// LLM-backed summarization callback.
///
/// Returns `Ok(None)` when the backend produced nothing useful; the caller
/// falls back progressively.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        text: &str,
        instructions: Option<&str>,
        previous_summary: Option<&str>,
    ) -> anyhow::Result<Option<String>>;
}

/// Statistics for one compaction pass.
#[derive(Debug, Clone, Default)]
pub struct CompactStats {
    pub dropped_count: usize,
    pub dropped_tokens: usize,
    pub kept_tokens: usize,
    /// Whether an LLM summary (vs the basic digest) made it into the output.
    pub summarized: bool,
}

pub fn estimate_text_tokens(text: &str) -> usize {
    text.len().div_ceil(4).max(1)
}

pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(|m| m.approx_tokens()).sum()
}

/// Compact `messages` to fit `max_tokens`.
///
/// Idempotent when already under budget.  The output always begins with
/// every original system message and ends with the last `preserve_recent`
/// input messages unchanged.
pub async fn compact(
    messages: &[Message],
    max_tokens: usize,
    preserve_recent: usize,
    summarizer: Option<&dyn Summarizer>,
    context_window: usize,
) -> (Vec<Message>, CompactStats) {
    let total = estimate_messages_tokens(messages);
    if total <= max_tokens {
        return (
            messages.to_vec(),
            CompactStats {
                kept_tokens: total,
                ..Default::default()
            },
        );
    }

    // System messages always survive, in order.
    let system: Vec<Message> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .cloned()
        .collect();
    let non_system: Vec<Message> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();

    let keep_n = preserve_recent.min(non_system.len());
    let split_at = non_system.len() - keep_n;
    // Keep tool-interaction groups intact: a tail that opens with a tool
    // result would reference a call summarized away, which providers reject.
    let split_at = aligned_split(&non_system, split_at);
    let tail: Vec<Message> = non_system[split_at..].to_vec();
    let mut prefix: Vec<Message> = non_system[..split_at].to_vec();

    let system_tokens = estimate_messages_tokens(&system);
    let tail_tokens = estimate_messages_tokens(&tail);
    let available = max_tokens
        .saturating_sub(system_tokens)
        .saturating_sub(tail_tokens)
        .saturating_sub(SUMMARY_RESERVE_TOKENS);

    // Prune the prefix: split into two roughly equal-token chunks and drop
    // the oldest until what remains fits.
    let mut dropped: Vec<Message> = Vec::new();
    while !prefix.is_empty() && estimate_messages_tokens(&prefix) > available {
        let chunks = split_by_token_share(&prefix, 2);
        if chunks.len() <= 1 {
            dropped.append(&mut prefix);
            break;
        }
        let mut iter = chunks.into_iter();
        dropped.extend(iter.next().unwrap_or_default());
        prefix = iter.flatten().collect();
    }

    let dropped_count = dropped.len();
    let dropped_tokens = estimate_messages_tokens(&dropped);

    let mut out = system;
    let mut summarized = false;
    if !dropped.is_empty() {
        let summary = match summarizer {
            Some(s) => match staged_summarize(&dropped, s, context_window).await {
                Some(text) => {
                    summarized = true;
                    text
                }
                None => basic_summary(&dropped),
            },
            None => basic_summary(&dropped),
        };
        out.push(Message::system(format!(
            "[Conversation summary — earlier history was compacted]\n{summary}"
        )));
    }
    out.extend(prefix);
    out.extend(tail);

    let kept_tokens = estimate_messages_tokens(&out);
    debug!(
        dropped_count,
        dropped_tokens, kept_tokens, max_tokens, "compacted conversation"
    );
    (
        out,
        CompactStats {
            dropped_count,
            dropped_tokens,
            kept_tokens,
            summarized,
        },
    )
}

/// Emergency truncation: system messages plus the last two non-system
/// messages.  Deterministic; never calls a model.
pub fn emergency_truncate(messages: &[Message]) -> Vec<Message> {
    let mut out: Vec<Message> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .cloned()
        .collect();
    let non_system: Vec<&Message> = messages.iter().filter(|m| m.role != Role::System).collect();
    let keep = non_system.len().saturating_sub(2);
    out.push(Message::system(
        "[Context emergency-truncated: earlier history was dropped to recover from a \
         context-window overflow. Ask the user to restate anything essential.]",
    ));
    out.extend(non_system[keep..].iter().map(|m| (*m).clone()));
    out
}

/// Move a split point backward until the tail does not open inside a
/// tool-interaction group (tool result, or assistant tool-call whose
/// results would land in the tail).
fn aligned_split(messages: &[Message], mut split_at: usize) -> usize {
    while split_at > 0 && split_at < messages.len() {
        let m = &messages[split_at];
        let is_tool_boundary = m.role == Role::Tool || !messages[split_at - 1].tool_calls.is_empty();
        if is_tool_boundary {
            split_at -= 1;
        } else {
            break;
        }
    }
    split_at
}

/// Split messages into `parts` chunks of roughly equal token share,
/// preserving order.
pub fn split_by_token_share(messages: &[Message], parts: usize) -> Vec<Vec<Message>> {
    if messages.is_empty() {
        return Vec::new();
    }
    let parts = parts.clamp(1, messages.len());
    if parts == 1 {
        return vec![messages.to_vec()];
    }
    let total = estimate_messages_tokens(messages);
    let target = total as f32 / parts as f32;

    let mut chunks: Vec<Vec<Message>> = Vec::new();
    let mut current: Vec<Message> = Vec::new();
    let mut current_tokens = 0f32;

    for message in messages {
        let tokens = message.approx_tokens() as f32;
        if !chunks.is_empty() || !current.is_empty() {
            if chunks.len() < parts - 1 && !current.is_empty() && current_tokens + tokens > target {
                chunks.push(std::mem::take(&mut current));
                current_tokens = 0.0;
            }
        }
        current.push(message.clone());
        current_tokens += tokens;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Adaptive chunk ratio: smaller chunks when the average message is large,
/// bounded to [MIN_CHUNK_RATIO, BASE_CHUNK_RATIO].
pub fn adaptive_chunk_ratio(messages: &[Message], context_window: usize) -> f32 {
    if messages.is_empty() || context_window == 0 {
        return BASE_CHUNK_RATIO;
    }
    let total = estimate_messages_tokens(messages) as f32;
    let avg = total / messages.len() as f32;
    let avg_ratio = (avg * SAFETY_MARGIN) / context_window as f32;
    if avg_ratio > 0.1 {
        let reduction = (avg_ratio * 2.0).min(BASE_CHUNK_RATIO - MIN_CHUNK_RATIO);
        (BASE_CHUNK_RATIO - reduction).max(MIN_CHUNK_RATIO)
    } else {
        BASE_CHUNK_RATIO
    }
}

fn is_oversized(message: &Message, context_window: usize) -> bool {
    (message.approx_tokens() as f32 * SAFETY_MARGIN) > context_window as f32 * OVERSIZED_SHARE
}

/// Staged LLM summarization of the dropped prefix with progressive
/// fallback.  Returns `None` when every stage failed and the caller should
/// use the basic digest.
async fn staged_summarize(
    dropped: &[Message],
    summarizer: &dyn Summarizer,
    context_window: usize,
) -> Option<String> {
    match summarize_in_stages(dropped, summarizer, context_window).await {
        Some(summary) => Some(summary),
        None => {
            // Progressive fallback: exclude oversized messages and note
            // their omission.
            let oversized: usize = dropped
                .iter()
                .filter(|m| is_oversized(m, context_window))
                .count();
            if oversized == 0 {
                return None;
            }
            let slimmed: Vec<Message> = dropped
                .iter()
                .filter(|m| !is_oversized(m, context_window))
                .cloned()
                .collect();
            warn!(oversized, "retrying summarization without oversized messages");
            let summary = summarize_in_stages(&slimmed, summarizer, context_window).await?;
            Some(format!(
                "{summary}\n[{oversized} oversized message(s) omitted from this summary]"
            ))
        }
    }
}

async fn summarize_in_stages(
    messages: &[Message],
    summarizer: &dyn Summarizer,
    context_window: usize,
) -> Option<String> {
    if messages.is_empty() {
        return None;
    }
    let _ratio = adaptive_chunk_ratio(messages, context_window);
    let parts = split_by_token_share(messages, SUMMARY_STAGES);

    let mut running: Option<String> = None;
    let mut partials: Vec<String> = Vec::new();
    for part in &parts {
        let text = serialize_history(part);
        match summarizer
            .summarize(&text, Some(SUMMARIZE_INSTRUCTIONS), running.as_deref())
            .await
        {
            Ok(Some(summary)) if !summary.trim().is_empty() => {
                running = Some(summary.clone());
                partials.push(summary);
            }
            Ok(_) => return None,
            Err(e) => {
                warn!("summarizer stage failed: {e:#}");
                return None;
            }
        }
    }

    if partials.len() <= 1 {
        return partials.pop();
    }
    let merged_input = partials.join("\n\n---\n\n");
    match summarizer
        .summarize(&merged_input, Some(MERGE_INSTRUCTIONS), None)
        .await
    {
        Ok(Some(merged)) if !merged.trim().is_empty() => Some(merged),
        Ok(_) => Some(merged_input),
        Err(e) => {
            warn!("summary merge failed, keeping partials: {e:#}");
            Some(merged_input)
        }
    }
}

/// Deterministic digest of the dropped prefix: the last few messages, role
/// plus leading characters.
fn basic_summary(dropped: &[Message]) -> String {
    let skip = dropped.len().saturating_sub(BASIC_SUMMARY_MESSAGES);
    let lines: Vec<String> = dropped[skip..]
        .iter()
        .map(|m| {
            let role = role_label(&m.role);
            let text = message_text(m);
            let mut end = text.len().min(BASIC_SUMMARY_CHARS);
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            format!("{role}: {}", &text[..end])
        })
        .collect();
    format!(
        "{} earlier message(s) were dropped. Most recent of them:\n{}",
        dropped.len(),
        lines.join("\n")
    )
}

fn role_label(role: &Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn message_text(m: &Message) -> String {
    let mut text = match &m.content {
        MessageContent::Text(t) => t.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|p| match p {
                vigil_model::ContentPart::Text { text } => text.as_str(),
                vigil_model::ContentPart::Image { .. } => "[image]",
            })
            .collect::<Vec<_>>()
            .join(" "),
    };
    for tc in &m.tool_calls {
        text.push_str(&format!(" [tool_call: {}({})]", tc.name, tc.arguments));
    }
    text
}

/// Serialise messages to plain text for a summarization prompt.
fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", role_label(&m.role), message_text(m)))
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
