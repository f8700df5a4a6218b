// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolResult};

/// Default maximum characters returned by web_fetch.
const FETCH_MAX_CHARS: usize = 50_000;

/// Fetch a URL and return its text content.  HTML is converted to plain
/// text; other content types pass through.
pub struct WebFetchTool {
    pub max_chars: usize,
    client: reqwest::Client,
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self {
            max_chars: FETCH_MAX_CHARS,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL and return its content as plain text. \
         HTML pages are converted to readable text; output is capped."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "The URL to fetch (http/https)" },
                "max_chars": { "type": "integer", "description": "Override the output cap" }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolResult {
        let Some(url) = call.arguments.get("url").and_then(|u| u.as_str()) else {
            return ToolResult::err("missing 'url' parameter");
        };
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return ToolResult::err("only http/https URLs are supported");
        }
        let max_chars = call
            .arguments
            .get("max_chars")
            .and_then(|m| m.as_u64())
            .map(|m| m as usize)
            .unwrap_or(self.max_chars);

        debug!(url, "fetching");
        let resp = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => return ToolResult::err(format!("fetch failed: {e}")),
        };
        let status = resp.status();
        if !status.is_success() {
            return ToolResult::err(format!("fetch failed: HTTP {status}"));
        }
        let is_html = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|c| c.to_str().ok())
            .map(|c| c.contains("text/html"))
            .unwrap_or(false);
        let body = match resp.text().await {
            Ok(t) => t,
            Err(e) => return ToolResult::err(format!("reading body failed: {e}")),
        };
        let mut text = if is_html {
            html2text::from_read(body.as_bytes(), 100)
        } else {
            body
        };
        if text.len() > max_chars {
            let mut end = max_chars;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
            text.push_str("\n[truncated]");
        }
        ToolResult::ok(text).with_extra("url", json!(url))
    }
}

/// Web search via the Brave Search API.  Needs an API key; without one the
/// tool reports how to configure it instead of failing silently.
pub struct WebSearchTool {
    pub api_key: Option<String>,
    client: reqwest::Client,
}

impl WebSearchTool {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.or_else(|| std::env::var("BRAVE_API_KEY").ok()),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web and return result titles, URLs, and snippets."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "The search query" },
                "count": { "type": "integer", "description": "Max results (default 5)" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolResult {
        let Some(query) = call.arguments.get("query").and_then(|q| q.as_str()) else {
            return ToolResult::err("missing 'query' parameter");
        };
        let Some(key) = self.api_key.as_deref() else {
            return ToolResult::err(
                "web search is not configured: set BRAVE_API_KEY or tools.web search api key",
            );
        };
        let count = call
            .arguments
            .get("count")
            .and_then(|c| c.as_u64())
            .unwrap_or(5)
            .min(20);

        let resp = match self
            .client
            .get("https://api.search.brave.com/res/v1/web/search")
            .query(&[("q", query), ("count", &count.to_string())])
            .header("X-Subscription-Token", key)
            .header("Accept", "application/json")
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return ToolResult::err(format!("search failed: {e}")),
        };
        if !resp.status().is_success() {
            return ToolResult::err(format!("search failed: HTTP {}", resp.status()));
        }
        let body: Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => return ToolResult::err(format!("parsing search response failed: {e}")),
        };

        let results = body["web"]["results"].as_array().cloned().unwrap_or_default();
        let mut lines = Vec::new();
        for r in results.iter().take(count as usize) {
            let title = r["title"].as_str().unwrap_or("");
            let url = r["url"].as_str().unwrap_or("");
            let desc = r["description"].as_str().unwrap_or("");
            lines.push(format!("{title}\n  {url}\n  {desc}"));
        }
        if lines.is_empty() {
            return ToolResult::ok("no results");
        }
        ToolResult::ok(lines.join("\n\n")).with_extra("result_count", json!(lines.len()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
