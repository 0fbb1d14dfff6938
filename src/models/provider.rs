use async_trait::async_trait;

use crate::chat::types::Message;
use crate::error::Result;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Opens a streamed completion. Errors here happen before any output.
    async fn stream_completion(&self, request: CompletionRequest) -> Result<Box<dyn CompletionStream>>;
    fn provider_name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: 1024,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Provider output, already reduced to what the endpoint relays.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// A new text block begins.
    BlockStarted,
    TextDelta(String),
    Finished,
}

#[async_trait]
pub trait CompletionStream: Send {
    /// `Ok(None)` only after `Finished` has been returned.
    async fn next_event(&mut self) -> Result<Option<ProviderEvent>>;
}
