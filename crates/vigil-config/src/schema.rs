// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless explicitly
/// disabled need a named function.
fn default_true() -> bool {
    true
}

fn default_model() -> String {
    "gpt-4o".into()
}
fn default_vision_fallback_model() -> String {
    "gemini-2.5-flash".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_context_window_tokens() -> usize {
    128_000
}
fn default_circuits_interval_seconds() -> u64 {
    1800
}
fn default_max_rounds() -> u32 {
    50
}
fn default_compaction_threshold() -> f32 {
    0.85
}
fn default_compaction_preserve_recent() -> usize {
    10
}
fn default_watcher_poll_seconds() -> u64 {
    5
}
fn default_subagent_pool_size() -> usize {
    3
}

/// Runtime configuration.
///
/// A single JSON object; every field has a sensible default so a missing or
/// empty config file yields a working runtime pointed at local Ollama-style
/// defaults.  API keys live in `remote_api_keys` keyed as
/// `<provider>_api_key` and are also resolved from the conventional
/// environment variables at lookup time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Primary model name.  Resolution to a provider happens in the model
    /// router: exact catalog match, then name-pattern match, then local
    /// Ollama.
    #[serde(default = "default_model")]
    pub model: String,
    /// Model substituted when a request carries an image and the primary
    /// model's provider lacks vision capability.
    #[serde(default = "default_vision_fallback_model")]
    pub vision_fallback_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Maximum tokens requested per completion.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Context window budget used by the compactor.
    #[serde(default = "default_context_window_tokens")]
    pub context_window_tokens: usize,
    #[serde(default = "default_true")]
    pub tools_enabled: bool,
    /// When true, read-only tool calls run without an approval round-trip.
    #[serde(default = "default_true")]
    pub tools_auto_execute: bool,
    #[serde(default)]
    pub circuits_enabled: bool,
    #[serde(default = "default_circuits_interval_seconds")]
    pub circuits_interval_seconds: u64,
    /// Start hour (0-23) of the circuits active window.  Gating applies only
    /// when both start and end are set.
    #[serde(default)]
    pub circuits_active_start: Option<u8>,
    /// End hour (0-23, exclusive) of the circuits active window.
    #[serde(default)]
    pub circuits_active_end: Option<u8>,
    /// `<provider>_api_key` → key.  Masked by [`Config::redacted`].
    #[serde(default)]
    pub remote_api_keys: HashMap<String, String>,
    /// Maximum agent-loop rounds before the wrap-up turn fires.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// Context fraction at which proactive compaction triggers.
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f32,
    /// Number of trailing messages preserved verbatim by the compactor.
    #[serde(default = "default_compaction_preserve_recent")]
    pub compaction_preserve_recent: usize,
    /// Per-provider ordered fallback model lists.  Empty → catalog defaults.
    #[serde(default)]
    pub fallback_chains: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub approval: ApprovalSettings,
    /// Directory watched for event files.  Defaults to `<data_dir>/events`.
    #[serde(default)]
    pub events_dir: Option<String>,
    #[serde(default = "default_watcher_poll_seconds")]
    pub watcher_poll_seconds: u64,
    /// Root for persisted state (audit log, task snapshots, lessons).
    /// Defaults to `./data`.
    #[serde(default)]
    pub data_dir: Option<String>,
    /// Maximum concurrently running subagents.
    #[serde(default = "default_subagent_pool_size")]
    pub subagent_pool_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: default_model(),
            vision_fallback_model: default_vision_fallback_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            context_window_tokens: default_context_window_tokens(),
            tools_enabled: true,
            tools_auto_execute: true,
            circuits_enabled: false,
            circuits_interval_seconds: default_circuits_interval_seconds(),
            circuits_active_start: None,
            circuits_active_end: None,
            remote_api_keys: HashMap::new(),
            max_rounds: default_max_rounds(),
            compaction_threshold: default_compaction_threshold(),
            compaction_preserve_recent: default_compaction_preserve_recent(),
            fallback_chains: HashMap::new(),
            approval: ApprovalSettings::default(),
            events_dir: None,
            watcher_poll_seconds: default_watcher_poll_seconds(),
            data_dir: None,
            subagent_pool_size: default_subagent_pool_size(),
        }
    }
}

impl Config {
    /// Resolve the API key for `provider`.
    ///
    /// Order: `remote_api_keys["<provider>_api_key"]`, then the conventional
    /// environment variable for that provider.  Local providers (ollama)
    /// need no key and return `None`.
    pub fn api_key_for(&self, provider: &str) -> Option<String> {
        let cfg_key = format!("{provider}_api_key");
        if let Some(k) = self.remote_api_keys.get(&cfg_key) {
            if !k.is_empty() {
                return Some(k.clone());
            }
        }
        let env_var = match provider {
            "openai" => "OPENAI_API_KEY",
            "anthropic" => "ANTHROPIC_API_KEY",
            "google" => "GEMINI_API_KEY",
            "xai" => "XAI_API_KEY",
            _ => return None,
        };
        std::env::var(env_var).ok().filter(|k| !k.is_empty())
    }

    /// Serialise the config with every API key masked.
    ///
    /// This is the only representation that may leave the process (status
    /// endpoints, logs, `show-config`).
    pub fn redacted(&self) -> serde_json::Value {
        let mut v = serde_json::to_value(self).unwrap_or_default();
        if let Some(keys) = v
            .get_mut("remote_api_keys")
            .and_then(|k| k.as_object_mut())
        {
            for (_, val) in keys.iter_mut() {
                *val = serde_json::Value::String(mask_value(val.as_str().unwrap_or("")));
            }
        }
        v
    }

    pub fn data_dir(&self) -> std::path::PathBuf {
        self.data_dir
            .as_deref()
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|| std::path::PathBuf::from("data"))
    }

    pub fn events_dir(&self) -> std::path::PathBuf {
        self.events_dir
            .as_deref()
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|| self.data_dir().join("events"))
    }
}

/// Mask a secret for display: keep the first 4 characters, star the rest.
fn mask_value(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    if value.len() <= 4 {
        return "****".into();
    }
    format!("{}{}", &value[..4], "*".repeat(8))
}

/// What happens to a command that matched neither the allowlist, the
/// denylist, nor the read-only heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DefaultPolicy {
    #[default]
    Allow,
    Deny,
    Ask,
}

impl std::fmt::Display for DefaultPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DefaultPolicy::Allow => write!(f, "allow"),
            DefaultPolicy::Deny => write!(f, "deny"),
            DefaultPolicy::Ask => write!(f, "ask"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalSettings {
    #[serde(default)]
    pub default_policy: DefaultPolicy,
    /// Extra allowlist entries merged with the builtin safe-command set.
    #[serde(default)]
    pub allowlist: Vec<String>,
    /// Extra denylist entries merged with the builtin dangerous-command set.
    #[serde(default)]
    pub denylist: Vec<String>,
    /// When false (the default), dangerous-pattern matches are logged as a
    /// risk signal but the command proceeds through the normal policy chain.
    /// When true, a match is a hard denial.
    #[serde(default)]
    pub enforce_dangerous: bool,
    #[serde(default = "default_true")]
    pub auto_approve_read_only: bool,
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_seconds: u64,
}

fn default_approval_timeout() -> u64 {
    60
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            default_policy: DefaultPolicy::Allow,
            allowlist: Vec::new(),
            denylist: Vec::new(),
            enforce_dangerous: false,
            auto_approve_read_only: true,
            approval_timeout_seconds: default_approval_timeout(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
