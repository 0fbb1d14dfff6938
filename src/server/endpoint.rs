use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, error, info, warn};

use crate::chat::attachment::{self, ValidationError};
use crate::chat::types::{new_message_id, Message, Part};
use crate::error::Error;
use crate::models::provider::{CompletionRequest, CompletionStream, ModelProvider, ProviderEvent};
use crate::server::http::{write_json, ChunkedWriter, Status};
use crate::transport::frame::{encode_frame, Frame};
use crate::transport::http::ErrorBody;

pub const MISSING_MESSAGES: &str = "Missing messages array.";
pub const INTERNAL_ERROR: &str = "An unexpected server error occurred.";
pub const STREAM_ERROR: &str = "An error occurred while processing your request.";

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("{error}")]
    BadRequest { error: String, details: Option<String> },

    #[error("Internal error: {0}")]
    Internal(#[from] Error),
}

impl EndpointError {
    fn missing_messages(details: Option<String>) -> Self {
        EndpointError::BadRequest {
            error: MISSING_MESSAGES.to_string(),
            details,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            EndpointError::BadRequest { .. } => Status::BadRequest,
            EndpointError::Internal(_) => Status::InternalServerError,
        }
    }

    /// Response body. Internal failures expose only a one-line diagnostic.
    pub fn body(&self) -> ErrorBody {
        match self {
            EndpointError::BadRequest { error, details } => ErrorBody::new(error.clone(), details.clone()),
            EndpointError::Internal(e) => ErrorBody::new(INTERNAL_ERROR, Some(e.diagnostic())),
        }
    }
}

impl From<ValidationError> for EndpointError {
    fn from(err: ValidationError) -> Self {
        EndpointError::BadRequest {
            error: err.to_string(),
            details: Some(err.details()),
        }
    }
}

#[derive(Deserialize)]
struct ChatRequestBody {
    messages: Option<serde_json::Value>,
}

/// `POST /api/chat`: validate attachments, open the provider stream and
/// relay it as frames. Holds no state between requests.
pub struct ChatEndpoint {
    provider: Arc<dyn ModelProvider>,
    model: String,
    max_tokens: u32,
}

/// A provider stream that has passed validation and is ready to relay.
pub struct OpenReply {
    pub message_id: String,
    pub reply_to: Option<String>,
    stream: Box<dyn CompletionStream>,
}

impl ChatEndpoint {
    pub fn new(provider: Arc<dyn ModelProvider>, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            provider,
            model: model.into(),
            max_tokens,
        }
    }

    pub fn parse_messages(body: &[u8]) -> Result<Vec<Message>, EndpointError> {
        let request: ChatRequestBody = serde_json::from_slice(body)
            .map_err(|e| EndpointError::missing_messages(Some(format!("Request body is not valid JSON: {}", e))))?;

        match request.messages {
            Some(value @ serde_json::Value::Array(_)) => serde_json::from_value(value)
                .map_err(|e| EndpointError::missing_messages(Some(format!("Invalid message: {}", e)))),
            _ => Err(EndpointError::missing_messages(None)),
        }
    }

    /// Checks every file part in order and stops at the first violation.
    pub fn validate_attachments(messages: &[Message]) -> Result<(), ValidationError> {
        for message in messages {
            for part in &message.parts {
                if let Part::File { media_type, payload } = part {
                    attachment::validate(media_type, payload)?;
                }
            }
        }
        Ok(())
    }

    /// Parses, validates and opens the provider stream.
    pub async fn open(&self, body: &[u8]) -> Result<OpenReply, EndpointError> {
        let messages = Self::parse_messages(body)?;

        if let Err(e) = Self::validate_attachments(&messages) {
            warn!("Rejected attachment: {}", e);
            return Err(e.into());
        }

        let reply_to = messages.last().map(|message| message.id.clone());
        let request = CompletionRequest::new(self.model.clone(), messages).with_max_tokens(self.max_tokens);
        debug!(
            "Forwarding {} messages to {} ({})",
            request.messages.len(),
            self.provider.provider_name(),
            request.model
        );

        let stream = self.provider.stream_completion(request).await.map_err(|e| {
            error!("Failed to open completion stream: {}", e);
            EndpointError::Internal(e)
        })?;

        Ok(OpenReply {
            message_id: new_message_id(),
            reply_to,
            stream,
        })
    }

    /// Serves one request body. Returns an IO error only when the client
    /// connection fails; the provider stream is dropped with it.
    pub async fn handle<R, W>(&self, body: &[u8], reader: &mut R, writer: &mut W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match self.open(body).await {
            Ok(reply) => relay(reply, reader, writer).await,
            Err(e) => {
                let status = e.status();
                write_json(writer, status, &e.body()).await
            }
        }
    }
}

/// Streams the reply as frames until the provider finishes, fails, or the
/// client goes away.
async fn relay<R, W>(reply: OpenReply, reader: &mut R, writer: &mut W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let OpenReply {
        message_id,
        reply_to,
        mut stream,
    } = reply;

    let mut out = ChunkedWriter::begin(writer, Status::Ok, "text/event-stream").await?;
    send(
        &mut out,
        &Frame::Start {
            message_id: message_id.clone(),
            reply_to,
        },
    )
    .await?;

    let mut fragments = 0usize;
    loop {
        let event = tokio::select! {
            event = stream.next_event() => event,
            _ = wait_for_disconnect(reader) => {
                info!("Client disconnected; dropping reply {}", message_id);
                return Ok(());
            }
        };

        let frame = match event {
            Ok(Some(ProviderEvent::BlockStarted)) => Frame::PartAppended { part: Part::text("") },
            Ok(Some(ProviderEvent::TextDelta(delta))) if delta.is_empty() => continue,
            Ok(Some(ProviderEvent::TextDelta(delta))) => {
                fragments += 1;
                Frame::TextDelta { delta }
            }
            Ok(Some(ProviderEvent::Finished)) | Ok(None) => {
                send(&mut out, &Frame::Finish).await?;
                debug!("Reply {} finished after {} fragments", message_id, fragments);
                break;
            }
            Err(e) => {
                error!("Completion stream failed for reply {}: {}", message_id, e);
                send(
                    &mut out,
                    &Frame::Error {
                        error_text: STREAM_ERROR.to_string(),
                    },
                )
                .await?;
                break;
            }
        };
        send(&mut out, &frame).await?;
    }

    out.finish().await
}

async fn send<W>(out: &mut ChunkedWriter<'_, W>, frame: &Frame) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = encode_frame(frame).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    out.write_chunk(encoded.as_bytes()).await
}

/// Resolves once the peer closes its side. Bytes sent after the request are
/// discarded.
async fn wait_for_disconnect<R>(reader: &mut R)
where
    R: AsyncRead + Unpin,
{
    let mut scratch = [0u8; 256];
    loop {
        match reader.read(&mut scratch).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}
