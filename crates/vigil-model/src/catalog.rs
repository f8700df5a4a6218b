// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Known-model table and provider resolution.
//!
//! A model name resolves to provider metadata in three steps: exact match in
//! the static table, pattern match on the name, then the local Ollama
//! fallback.  The table also carries context windows and vision capability
//! used by the router for budget and vision-fallback decisions.

/// Metadata for one known model.
#[derive(Debug, Clone)]
pub struct ModelCatalogEntry {
    /// Name as users write it in config.
    pub id: &'static str,
    pub provider: &'static str,
    pub context_window: u32,
    pub supports_vision: bool,
}

/// The static known-models table.
///
/// Not exhaustive — unknown names fall through to pattern resolution — but
/// covers the models the default fallback chains reference so their context
/// windows are always available.
pub fn static_catalog() -> &'static [ModelCatalogEntry] {
    const CATALOG: &[ModelCatalogEntry] = &[
        // OpenAI
        ModelCatalogEntry { id: "gpt-4o", provider: "openai", context_window: 128_000, supports_vision: true },
        ModelCatalogEntry { id: "gpt-4o-mini", provider: "openai", context_window: 128_000, supports_vision: true },
        ModelCatalogEntry { id: "gpt-4.1", provider: "openai", context_window: 1_000_000, supports_vision: true },
        ModelCatalogEntry { id: "gpt-4.1-mini", provider: "openai", context_window: 1_000_000, supports_vision: true },
        ModelCatalogEntry { id: "o3-mini", provider: "openai", context_window: 200_000, supports_vision: false },
        ModelCatalogEntry { id: "o4-mini", provider: "openai", context_window: 200_000, supports_vision: true },
        // Anthropic
        ModelCatalogEntry { id: "claude-3-5-sonnet-20241022", provider: "anthropic", context_window: 200_000, supports_vision: true },
        ModelCatalogEntry { id: "claude-3-5-haiku-20241022", provider: "anthropic", context_window: 200_000, supports_vision: true },
        ModelCatalogEntry { id: "claude-3-7-sonnet-20250219", provider: "anthropic", context_window: 200_000, supports_vision: true },
        ModelCatalogEntry { id: "claude-sonnet-4-5", provider: "anthropic", context_window: 200_000, supports_vision: true },
        ModelCatalogEntry { id: "claude-opus-4-1", provider: "anthropic", context_window: 200_000, supports_vision: true },
        ModelCatalogEntry { id: "claude-haiku-4-5", provider: "anthropic", context_window: 200_000, supports_vision: true },
        // Google
        ModelCatalogEntry { id: "gemini-2.5-flash", provider: "google", context_window: 1_048_576, supports_vision: true },
        ModelCatalogEntry { id: "gemini-2.5-pro", provider: "google", context_window: 1_048_576, supports_vision: true },
        ModelCatalogEntry { id: "gemini-3-flash-preview", provider: "google", context_window: 1_048_576, supports_vision: true },
        // xAI
        ModelCatalogEntry { id: "grok-3", provider: "xai", context_window: 131_072, supports_vision: false },
        ModelCatalogEntry { id: "grok-4", provider: "xai", context_window: 256_000, supports_vision: true },
        // Local Ollama
        ModelCatalogEntry { id: "llama3.2", provider: "ollama", context_window: 128_000, supports_vision: false },
        ModelCatalogEntry { id: "llama3.2-vision:11b", provider: "ollama", context_window: 128_000, supports_vision: true },
        ModelCatalogEntry { id: "qwen2.5:latest", provider: "ollama", context_window: 32_768, supports_vision: false },
        ModelCatalogEntry { id: "dolphin3:latest", provider: "ollama", context_window: 32_768, supports_vision: false },
    ];
    CATALOG
}

pub fn lookup(model: &str) -> Option<&'static ModelCatalogEntry> {
    static_catalog().iter().find(|e| e.id == model)
}

/// Resolve a model name to its provider id.
///
/// Order: exact catalog match, then name-pattern match, then local Ollama.
pub fn resolve_provider(model: &str) -> &'static str {
    if let Some(entry) = lookup(model) {
        return entry.provider;
    }
    let m = model.to_ascii_lowercase();
    if m.starts_with("claude") || m.starts_with("anthropic") {
        return "anthropic";
    }
    if m.starts_with("gemini") || m.starts_with("gemma") {
        return "google";
    }
    if m.starts_with("grok") || m.starts_with("xai") {
        return "xai";
    }
    if m.starts_with("gpt-")
        || m.starts_with("o1-")
        || m.starts_with("o3-")
        || m.starts_with("o4-")
    {
        return "openai";
    }
    "ollama"
}

/// Providers whose API accepts image input.
pub fn provider_supports_vision(provider: &str) -> bool {
    matches!(provider, "google" | "anthropic" | "xai" | "openai" | "ollama")
}

/// Whether a specific model accepts image input.
///
/// Catalog entries answer authoritatively; unknown models inherit their
/// provider's capability (conservative for ollama, where most local models
/// are text-only: unknown ollama models report `false`).
pub fn model_supports_vision(model: &str) -> bool {
    if let Some(entry) = lookup(model) {
        return entry.supports_vision;
    }
    let provider = resolve_provider(model);
    if provider == "ollama" {
        return false;
    }
    provider_supports_vision(provider)
}

/// Default fallback chain for a provider, tried in order after the primary.
pub fn default_fallback_chain(provider: &str) -> Vec<String> {
    let models: &[&str] = match provider {
        "openai" => &["gpt-4o", "gpt-4o-mini", "gpt-4.1-mini"],
        "anthropic" => &[
            "claude-sonnet-4-5",
            "claude-3-5-sonnet-20241022",
            "claude-3-5-haiku-20241022",
        ],
        "google" => &["gemini-2.5-flash", "gemini-2.5-pro"],
        "xai" => &["grok-4", "grok-3"],
        "ollama" => &["dolphin3:latest", "llama3.2-vision:11b", "qwen2.5:latest"],
        _ => &[],
    };
    models.iter().map(|s| s.to_string()).collect()
}

/// Context window for a model; a safe default for unknown names.
pub fn context_window(model: &str) -> u32 {
    lookup(model).map(|e| e.context_window).unwrap_or(32_768)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
