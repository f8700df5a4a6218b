// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{catalog, CompletionRequest, ResponseEvent};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

/// One wire-protocol driver bound to a specific model.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider id ("openai", "anthropic", "google", "xai", "ollama", ...).
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Whether the bound model accepts image input.
    fn supports_vision(&self) -> bool {
        catalog::model_supports_vision(self.model_name())
    }

    /// Context window for the bound model.
    fn context_window(&self) -> u32 {
        catalog::context_window(self.model_name())
    }

    /// Send a completion request and return a streaming response.
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream>;
}
