//! The completion endpoint and the small HTTP server that hosts it.

pub mod endpoint;
pub mod http;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::transport::http::ErrorBody;

pub use endpoint::{ChatEndpoint, EndpointError};
use http::{read_request, write_json, RequestError, Status};

pub const CHAT_PATH: &str = "/api/chat";

const LINGER: Duration = Duration::from_millis(500);

/// Accepts connections and serves each on its own task.
pub struct Server {
    listener: TcpListener,
    endpoint: Arc<ChatEndpoint>,
    max_body_bytes: u64,
}

impl Server {
    pub async fn bind(addr: &str, endpoint: ChatEndpoint, max_body_bytes: u64) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::platform(format!("Bind {} failed: {}", addr, e)))?;

        Ok(Self {
            listener,
            endpoint: Arc::new(endpoint),
            max_body_bytes,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until `shutdown` is cancelled. In-flight connections finish on
    /// their own tasks.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!("Listening on http://{}{}", self.local_addr()?, CHAT_PATH);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let endpoint = self.endpoint.clone();
                    let max_body_bytes = self.max_body_bytes;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, endpoint, max_body_bytes).await {
                            warn!("Connection error from {}: {}", peer, e);
                        }
                    });
                }
                Err(e) => warn!("Accept error: {}", e),
            }
        }

        info!("Server stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    endpoint: Arc<ChatEndpoint>,
    max_body_bytes: u64,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request = match read_request(&mut reader, max_body_bytes).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(RequestError::Io(e)) => return Err(e),
        Err(e) => {
            debug!("Bad request from {}: {}", peer, e);
            write_json(&mut write_half, e.status(), &ErrorBody::new(e.to_string(), None)).await?;
            write_half.shutdown().await?;
            // Unread request bytes would turn our close into a reset that can
            // destroy the response before the client reads it.
            let _ = tokio::time::timeout(LINGER, tokio::io::copy(&mut reader, &mut tokio::io::sink())).await;
            return Ok(());
        }
    };

    debug!("{} {} from {}", request.method, request.path, peer);
    match (request.method.as_str(), request.path.as_str()) {
        ("POST", CHAT_PATH) => endpoint.handle(&request.body, &mut reader, &mut write_half).await,
        (_, CHAT_PATH) => {
            write_json(
                &mut write_half,
                Status::MethodNotAllowed,
                &ErrorBody::new("Method not allowed.", None),
            )
            .await
        }
        _ => write_json(&mut write_half, Status::NotFound, &ErrorBody::new("Not found.", None)).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::attachment::tests::PNG_BYTES;
    use crate::chat::types::{build_user_message, Message, Part};
    use crate::models::provider::tests::{ScriptedProvider, Step};
    use crate::models::ProviderEvent;
    use crate::transport::{HttpTransport, StreamDelta, Transport, TransportError};
    use std::sync::atomic::Ordering;

    struct Running {
        url: String,
        shutdown: CancellationToken,
    }

    impl Drop for Running {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    async fn start(provider: Arc<ScriptedProvider>, max_body_bytes: u64) -> Running {
        let endpoint = ChatEndpoint::new(provider, "claude-test", 256);
        let server = Server::bind("127.0.0.1:0", endpoint, max_body_bytes).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.run(shutdown.clone()));
        Running {
            url: format!("http://{}", addr),
            shutdown,
        }
    }

    fn transport(running: &Running) -> HttpTransport {
        HttpTransport::new(format!("{}{}", running.url, CHAT_PATH), Duration::from_secs(5)).unwrap()
    }

    async fn collect(transport: &HttpTransport, messages: &[Message]) -> Vec<StreamDelta> {
        let mut stream = transport.submit(messages).await.unwrap();
        let mut deltas = Vec::new();
        while let Some(delta) = stream.next_delta().await {
            deltas.push(delta);
        }
        deltas
    }

    #[tokio::test]
    async fn test_text_reply_end_to_end() {
        let fragments = ["The ", "quick ", "brown ", "fox."];
        let running = start(ScriptedProvider::replying(&fragments), 1024 * 1024).await;
        let transport = transport(&running);

        let message = build_user_message("tell me something", None).unwrap();
        let deltas = collect(&transport, &[message]).await;

        assert_eq!(deltas.first(), Some(&StreamDelta::PartAppended(Part::text(""))));
        assert_eq!(deltas.last(), Some(&StreamDelta::StreamEnded));

        let text: String = deltas
            .iter()
            .filter_map(|delta| match delta {
                StreamDelta::PartialTextExtended(fragment) => Some(fragment.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, fragments.concat());
    }

    #[tokio::test]
    async fn test_unsupported_attachment_end_to_end() {
        let provider = ScriptedProvider::replying(&["never"]);
        let running = start(provider.clone(), 1024 * 1024).await;
        let transport = transport(&running);

        let message = build_user_message(
            "",
            Some(Part::file("application/zip", "data:application/zip;base64,UEsDBA==")),
        )
        .unwrap();

        match transport.submit(&[message]).await {
            Err(TransportError::ServerError { status, message }) => {
                assert_eq!(status, 400);
                assert!(message.contains("application/zip"), "{}", message);
            }
            Err(other) => panic!("expected a 400, got {:?}", other),
            Ok(_) => panic!("expected a 400, got a stream"),
        }
        assert!(provider.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_image_attachment_end_to_end() {
        let provider = ScriptedProvider::replying(&["A single pixel."]);
        let running = start(provider.clone(), 1024 * 1024).await;
        let transport = transport(&running);

        let payload = crate::chat::attachment::encode("image/png", PNG_BYTES);
        let message = build_user_message("what is it?", Some(Part::file("image/png", payload))).unwrap();
        let deltas = collect(&transport, &[message]).await;

        assert_eq!(deltas.last(), Some(&StreamDelta::StreamEnded));
        assert_eq!(provider.requests.lock()[0].messages[0].parts.len(), 2);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_end_to_end() {
        let provider = ScriptedProvider::new(vec![
            Step::Event(ProviderEvent::BlockStarted),
            Step::Event(ProviderEvent::TextDelta("one ".to_string())),
            Step::Event(ProviderEvent::TextDelta("two".to_string())),
            Step::Fail("overloaded".to_string()),
        ]);
        let running = start(provider, 1024 * 1024).await;
        let transport = transport(&running);

        let deltas = collect(&transport, &[build_user_message("hi", None).unwrap()]).await;
        assert_eq!(deltas.len(), 4);
        assert_eq!(
            deltas.last(),
            Some(&StreamDelta::StreamFailed(TransportError::ServerError {
                status: 200,
                message: endpoint::STREAM_ERROR.to_string(),
            }))
        );
    }

    #[tokio::test]
    async fn test_reply_announces_message_id() {
        let running = start(ScriptedProvider::replying(&["ok"]), 1024 * 1024).await;
        let transport = transport(&running);

        let mut stream = transport
            .submit(&[build_user_message("hi", None).unwrap()])
            .await
            .unwrap();
        assert!(stream.message_id().is_none());
        stream.next_delta().await;
        assert!(stream.message_id().is_some());
    }

    #[tokio::test]
    async fn test_client_disconnect_drops_provider_stream() {
        let provider = ScriptedProvider::new(vec![
            Step::Event(ProviderEvent::BlockStarted),
            Step::Event(ProviderEvent::TextDelta("slow".to_string())),
            Step::Pause(Duration::from_secs(60)),
            Step::Event(ProviderEvent::Finished),
        ]);
        let running = start(provider.clone(), 1024 * 1024).await;
        let transport = transport(&running);

        let mut stream = transport
            .submit(&[build_user_message("hi", None).unwrap()])
            .await
            .unwrap();
        stream.next_delta().await;
        stream.next_delta().await;
        stream.cancel();
        drop(stream);

        let dropped = tokio::time::timeout(Duration::from_secs(5), async {
            while !provider.dropped.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(dropped.is_ok(), "provider stream was not released");
    }

    #[tokio::test]
    async fn test_routing_and_limits() {
        let running = start(ScriptedProvider::replying(&["ok"]), 64).await;
        let client = reqwest::Client::new();

        let response = client.get(format!("{}/nope", running.url)).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 404);

        let response = client.get(format!("{}{}", running.url, CHAT_PATH)).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 405);

        let response = client
            .post(format!("{}{}", running.url, CHAT_PATH))
            .body("{}")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);
        let body: ErrorBody = response.json().await.unwrap();
        assert_eq!(body.error, endpoint::MISSING_MESSAGES);

        let response = client
            .post(format!("{}{}", running.url, CHAT_PATH))
            .body("x".repeat(128))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 413);
    }
}
