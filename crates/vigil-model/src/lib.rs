// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod catalog;
pub mod failover;
pub mod sanitize;
pub(crate) mod openai_compat;
mod anthropic;
mod google;
mod mock;
mod provider;
mod router;
mod types;

pub use anthropic::AnthropicProvider;
pub use google::GoogleProvider;
pub use mock::{MockProvider, ScriptedMockProvider, Script};
pub use provider::{ModelProvider, ResponseStream};
pub use router::{ModelRouter, ProviderFactory, RouterResponse};
pub use types::*;
