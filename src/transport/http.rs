use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chat::types::Message;
use crate::error::Result;
use crate::transport::frame::{Frame, FrameDecoder};
use crate::transport::{DeltaStream, StreamDelta, Transport, TransportError};

/// Posts to the completion endpoint with reqwest and reads the chunked body
/// frame by frame. Holds at most one live stream.
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    in_flight: Mutex<Option<CancellationToken>>,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            in_flight: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Cancels the previous stream, if any, and registers a fresh token.
    fn begin_stream(&self) -> CancellationToken {
        let mut slot = self.in_flight.lock();
        if let Some(previous) = slot.take() {
            if !previous.is_cancelled() {
                debug!("Cancelling previous stream before opening a new one");
            }
            previous.cancel();
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        token
    }
}

#[derive(Serialize)]
struct ChatRequestBody<'a> {
    messages: &'a [Message],
}

/// `{ error, details? }` body of 4xx/5xx responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, details: Option<String>) -> Self {
        Self {
            error: error.into(),
            details,
        }
    }

    fn describe(&self) -> String {
        match &self.details {
            Some(details) if !details.is_empty() => format!("{} {}", self.error, details),
            _ => self.error.clone(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn submit(&self, messages: &[Message]) -> std::result::Result<Box<dyn DeltaStream>, TransportError> {
        let token = self.begin_stream();
        debug!("Submitting {} messages to {}", messages.len(), self.endpoint);

        let request = self
            .client
            .post(&self.endpoint)
            .json(&ChatRequestBody { messages });

        let sent = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = request.send() => Some(result),
        };
        let response = match sent {
            None => return Err(TransportError::StreamAborted),
            Some(result) => result.map_err(|e| TransportError::NetworkFailure(e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<ErrorBody>(&body) {
                Ok(error_body) => error_body.describe(),
                Err(_) if body.trim().is_empty() => status
                    .canonical_reason()
                    .unwrap_or("Request failed")
                    .to_string(),
                Err(_) => body.trim().to_string(),
            };
            warn!("Completion endpoint returned {}: {}", status, message);
            return Err(TransportError::ServerError {
                status: status.as_u16(),
                message,
            });
        }

        Ok(Box::new(HttpDeltaStream::new(response, token)))
    }
}

pub struct HttpDeltaStream {
    response: Option<reqwest::Response>,
    decoder: FrameDecoder,
    token: CancellationToken,
    status: u16,
    message_id: Option<String>,
    done: bool,
}

impl HttpDeltaStream {
    fn new(response: reqwest::Response, token: CancellationToken) -> Self {
        Self {
            status: response.status().as_u16(),
            response: Some(response),
            decoder: FrameDecoder::new(),
            token,
            message_id: None,
            done: false,
        }
    }

    fn close(&mut self) {
        self.done = true;
        self.response = None;
    }

    fn fail(&mut self, error: TransportError) -> StreamDelta {
        warn!("Reply stream failed: {}", error);
        self.close();
        StreamDelta::StreamFailed(error)
    }

    fn apply_frame(&mut self, frame: serde_json::Result<Frame>) -> Option<StreamDelta> {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                return Some(self.fail(TransportError::NetworkFailure(format!(
                    "Malformed stream frame: {}",
                    e
                ))))
            }
        };

        match frame {
            Frame::Start { message_id, reply_to } => {
                debug!("Reply {} started (in reply to {:?})", message_id, reply_to);
                self.message_id = Some(message_id);
                None
            }
            Frame::PartAppended { part } => Some(StreamDelta::PartAppended(part)),
            Frame::TextDelta { delta } => Some(StreamDelta::PartialTextExtended(delta)),
            Frame::Finish => {
                self.close();
                Some(StreamDelta::StreamEnded)
            }
            Frame::Error { error_text } => Some(self.fail(TransportError::ServerError {
                status: self.status,
                message: error_text,
            })),
        }
    }
}

#[async_trait]
impl DeltaStream for HttpDeltaStream {
    async fn next_delta(&mut self) -> Option<StreamDelta> {
        loop {
            if self.done {
                return None;
            }

            if let Some(frame) = self.decoder.next_frame() {
                match self.apply_frame(frame) {
                    Some(delta) => return Some(delta),
                    None => continue,
                }
            }

            let response = match self.response.as_mut() {
                Some(response) => response,
                None => return Some(self.fail(TransportError::StreamAborted)),
            };

            let chunk = tokio::select! {
                biased;
                _ = self.token.cancelled() => None,
                chunk = response.chunk() => Some(chunk),
            };

            match chunk {
                None => {
                    debug!("Reply stream cancelled");
                    self.close();
                    return None;
                }
                Some(Ok(Some(bytes))) => self.decoder.push(&bytes),
                Some(Ok(None)) => {
                    self.response = None;
                    if let Some(frame) = self.decoder.finish() {
                        if let Some(delta) = self.apply_frame(frame) {
                            return Some(delta);
                        }
                    }
                    return Some(self.fail(TransportError::StreamAborted));
                }
                Some(Err(e)) => return Some(self.fail(TransportError::NetworkFailure(e.to_string()))),
            }
        }
    }

    fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    fn cancel(&mut self) {
        self.token.cancel();
        self.close();
    }
}

impl Drop for HttpDeltaStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_stream_cancels_previous() {
        let transport = HttpTransport::new("http://127.0.0.1:9/api/chat", Duration::from_secs(1)).unwrap();
        let first = transport.begin_stream();
        assert!(!first.is_cancelled());

        let second = transport.begin_stream();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn test_error_body_description() {
        let body = ErrorBody::new("Unsupported file type: application/zip", Some("Use PNG.".to_string()));
        assert_eq!(body.describe(), "Unsupported file type: application/zip Use PNG.");

        let body: ErrorBody = serde_json::from_str(r#"{"error":"Missing messages array."}"#).unwrap();
        assert_eq!(body.describe(), "Missing messages array.");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_network_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = format!("http://127.0.0.1:{}/api/chat", port);
        let transport = HttpTransport::new(endpoint, Duration::from_secs(2)).unwrap();
        let result = transport.submit(&[]).await;
        assert!(matches!(result, Err(TransportError::NetworkFailure(_))));
    }
}
