//! LLM provider seam
//!
//! The core treats the model as an opaque text-in/text-out oracle. All
//! structure comes from prompts and the lenient response parsing in the
//! ReAct executor.

use anyhow::Result;
use async_trait::async_trait;

/// Text-in/text-out oracle. Implementations may wrap a local model, an HTTP
/// endpoint, or a subprocess; the core never branches on provider specifics.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn generate(&self, prompt: String) -> Result<String>;
}

/// Provider returning a fixed response, for wiring and tests.
pub struct StaticProvider {
    response: String,
}

impl StaticProvider {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
        }
    }
}

#[async_trait]
impl LLMProvider for StaticProvider {
    async fn generate(&self, _prompt: String) -> Result<String> {
        Ok(self.response.clone())
    }
}
