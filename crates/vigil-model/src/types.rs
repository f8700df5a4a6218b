use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Content part types ───────────────────────────────────────────────────────

/// A single content part in a multi-part message.
///
/// Images are carried as raw base64 plus a media type; each provider driver
/// serializes them into its own wire shape (OpenAI data URLs, Anthropic
/// base64 source blocks, Gemini inline_data).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        /// MIME type, e.g. `image/png`.
        media_type: String,
        /// Base64-encoded image bytes (no data-URL prefix).
        data: String,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Image {
            media_type: media_type.into(),
            data: data.into(),
        }
    }

    /// Render this part as an OpenAI-style data URL.  Text parts return None.
    pub fn as_data_url(&self) -> Option<String> {
        match self {
            Self::Image { media_type, data } => {
                Some(format!("data:{media_type};base64,{data}"))
            }
            Self::Text { .. } => None,
        }
    }
}

/// Parse a data URL of the form `data:<mime>;base64,<b64>` into
/// `(media_type, base64)`.  Returns `Err` for anything else so callers can
/// decide how to treat plain URLs.
pub fn parse_data_url(url: &str) -> Result<(String, String), &'static str> {
    let rest = url.strip_prefix("data:").ok_or("not a data URL")?;
    let (meta, b64) = rest.split_once(',').ok_or("malformed data URL")?;
    let mime = meta.strip_suffix(";base64").unwrap_or(meta).to_string();
    Ok((mime, b64.to_string()))
}

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Textual or multi-part message body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(t) => t.is_empty(),
            Self::Parts(p) => p.is_empty(),
        }
    }
}

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Opaque identifier from the model; unique within a session.
    pub id: String,
    pub name: String,
    /// Parsed JSON argument object.
    pub arguments: Value,
}

/// A single turn in the conversation.
///
/// Assistant messages may carry an ordered list of tool calls alongside (or
/// instead of) text.  Tool messages answer exactly one call and carry both
/// the call id and the tool name.  `raw_parts` preserves the provider's
/// original part array for drivers (Gemini) that reject a request unless an
/// assistant tool-call turn is echoed back byte-for-byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name on tool-role messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_parts: Option<Value>,
}

impl Message {
    fn plain(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            raw_parts: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::plain(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::plain(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, text)
    }

    /// Assistant message carrying all tool calls for one round.
    pub fn assistant_with_tool_calls(text: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            tool_calls: calls,
            tool_call_id: None,
            name: None,
            raw_parts: None,
        }
    }

    pub fn user_with_parts(parts: Vec<ContentPart>) -> Self {
        let content = if parts.is_empty() {
            MessageContent::Text(String::new())
        } else if parts.len() == 1 {
            if let ContentPart::Text { text } = &parts[0] {
                MessageContent::Text(text.clone())
            } else {
                MessageContent::Parts(parts)
            }
        } else {
            MessageContent::Parts(parts)
        };
        Self {
            role: Role::User,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            raw_parts: None,
        }
    }

    /// Tool-role message answering the call with id `id` made by tool `name`.
    pub fn tool_result(
        id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(id.into()),
            name: Some(name.into()),
            raw_parts: None,
        }
    }

    /// Return the plain text of this message, if it is a single text body.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::Parts(parts) if parts.len() == 1 => match &parts[0] {
                ContentPart::Text { text } => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn has_images(&self) -> bool {
        matches!(&self.content, MessageContent::Parts(parts)
            if parts.iter().any(|p| matches!(p, ContentPart::Image { .. })))
    }

    /// Approximate token count used for context management.
    ///
    /// 4-chars-per-token heuristic for text; a fixed 85 tokens per image
    /// part (the base cost of an image reference).
    pub fn approx_tokens(&self) -> usize {
        let mut tokens = match &self.content {
            MessageContent::Text(t) => t.len().div_ceil(4),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len().div_ceil(4),
                    ContentPart::Image { .. } => 85,
                })
                .sum(),
        };
        for tc in &self.tool_calls {
            tokens += (tc.name.len() + tc.arguments.to_string().len()).div_ceil(4);
        }
        tokens.max(1)
    }
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub stream: bool,
}

/// A single streamed event from a model provider.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// A text delta streamed from the model.
    TextDelta(String),
    /// A thinking/reasoning delta, kept out of the answer channel.
    ThinkingDelta(String),
    /// The model wants to call a tool.  Arguments may arrive across many
    /// deltas; `index` routes accumulation for parallel calls.
    ToolCall {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// The provider's raw part array for this assistant turn (Gemini).
    /// Must be echoed back verbatim when the turn is retransmitted.
    RawParts(Value),
    /// Final usage statistics.
    Usage {
        input_tokens: u32,
        output_tokens: u32,
    },
    /// The model hit its output-token limit; trailing content is truncated.
    MaxTokens,
    /// The stream finished normally.
    Done,
    /// A recoverable mid-stream error (non-fatal warning).
    Error(String),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
