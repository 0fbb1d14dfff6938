use async_trait::async_trait;
use memchr::memchr;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::app::config::ModelConfig;
use crate::chat::attachment;
use crate::chat::types::{Message, Part};
use crate::error::{Error, Result};
use crate::models::provider::{CompletionRequest, CompletionStream, ModelProvider, ProviderEvent};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Streams completions from the Anthropic Messages API.
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    endpoint: String,
    idle_timeout: Duration,
}

impl AnthropicProvider {
    pub fn new(api_key: String, config: &ModelConfig) -> Result<Self> {
        // A reply may stream for longer than any fixed deadline, so the limit
        // applies to each wait for the next response bytes instead.
        let idle_timeout = Duration::from_secs(config.timeout_seconds);
        let client = Client::builder().connect_timeout(idle_timeout).build()?;

        Ok(Self {
            client,
            api_key,
            endpoint: config.api_endpoint.clone(),
            idle_timeout,
        })
    }

    fn convert_messages(messages: &[Message]) -> Result<Vec<AnthropicMessage>> {
        let mut converted = Vec::with_capacity(messages.len());

        for message in messages {
            let mut content = Vec::with_capacity(message.parts.len());
            for part in &message.parts {
                match part {
                    Part::Text { content: text } if text.is_empty() => {}
                    Part::Text { content: text } => content.push(ContentBlock::Text { text: text.clone() }),
                    Part::File { media_type, payload } => {
                        let data = attachment::base64_data(payload)?;
                        content.push(ContentBlock::Image {
                            source: ImageSource {
                                kind: "base64",
                                media_type: media_type.clone(),
                                data: data.to_string(),
                            },
                        });
                    }
                }
            }

            // The API rejects empty content, e.g. a reply that failed before any text.
            if content.is_empty() {
                debug!("Skipping message {} with no content", message.id);
                continue;
            }

            converted.push(AnthropicMessage {
                role: message.role.as_str(),
                content,
            });
        }

        Ok(converted)
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    async fn stream_completion(&self, request: CompletionRequest) -> Result<Box<dyn CompletionStream>> {
        let body = AnthropicRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            messages: Self::convert_messages(&request.messages)?,
            stream: true,
        };
        debug!(
            "Making Anthropic streaming request to model {} with {} messages",
            body.model,
            body.messages.len()
        );

        let request = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send();
        let response = tokio::time::timeout(self.idle_timeout, request)
            .await
            .map_err(|_| {
                Error::model_provider(format!("No response within {}s", self.idle_timeout.as_secs()))
            })??;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            warn!("Anthropic API error: {} - {}", status, error_text);
            return Err(Error::model_provider(format!("API error {}: {}", status, error_text)));
        }

        Ok(Box::new(AnthropicStream::new(response, self.idle_timeout)))
    }

    fn provider_name(&self) -> &str {
        "anthropic"
    }
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockStart { content_block: BlockInfo },
    ContentBlockDelta { delta: BlockDelta },
    MessageStop,
    Error { error: ApiError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct BlockInfo {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

/// Server-sent events from the Messages API, reduced to [`ProviderEvent`]s.
pub struct AnthropicStream {
    response: Option<reqwest::Response>,
    buffer: Vec<u8>,
    idle_timeout: Duration,
    finished: bool,
}

impl AnthropicStream {
    fn new(response: reqwest::Response, idle_timeout: Duration) -> Self {
        Self {
            response: Some(response),
            buffer: Vec::new(),
            idle_timeout,
            finished: false,
        }
    }

    async fn read_next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(newline_pos) = memchr(b'\n', &self.buffer) {
                let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            let Some(response) = self.response.as_mut() else {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let rest = std::mem::take(&mut self.buffer);
                return Ok(Some(String::from_utf8_lossy(&rest).into_owned()));
            };

            let chunk = tokio::time::timeout(self.idle_timeout, response.chunk())
                .await
                .map_err(|_| {
                    Error::model_provider(format!("Stream stalled for {}s", self.idle_timeout.as_secs()))
                })?;
            match chunk {
                Ok(Some(chunk)) => self.buffer.extend_from_slice(&chunk),
                Ok(None) => self.response = None,
                Err(e) => return Err(Error::model_provider(format!("Stream read error: {}", e))),
            }
        }
    }
}

/// Maps one `data:` payload. `Ok(None)` for events with no relay counterpart.
fn map_event(data: &str) -> Result<Option<ProviderEvent>> {
    let event: StreamEvent = match serde_json::from_str(data) {
        Ok(event) => event,
        Err(e) => {
            debug!("Failed to parse stream event: {} (data: {})", e, data);
            return Ok(None);
        }
    };

    match event {
        StreamEvent::ContentBlockStart { content_block } if content_block.kind == "text" => {
            Ok(Some(ProviderEvent::BlockStarted))
        }
        StreamEvent::ContentBlockDelta {
            delta: BlockDelta::TextDelta { text },
        } => Ok(Some(ProviderEvent::TextDelta(text))),
        StreamEvent::MessageStop => Ok(Some(ProviderEvent::Finished)),
        StreamEvent::Error { error } => Err(Error::model_provider(format!(
            "{}: {}",
            error.kind, error.message
        ))),
        _ => Ok(None),
    }
}

#[async_trait]
impl CompletionStream for AnthropicStream {
    async fn next_event(&mut self) -> Result<Option<ProviderEvent>> {
        if self.finished {
            return Ok(None);
        }

        while let Some(line) = self.read_next_line().await? {
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };

            if let Some(event) = map_event(data.trim_start())? {
                if event == ProviderEvent::Finished {
                    self.finished = true;
                    self.response = None;
                }
                return Ok(Some(event));
            }
        }

        Err(Error::model_provider("Stream ended before message_stop"))
    }
}
