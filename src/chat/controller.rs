use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::account::Session;
use crate::chat::draft::{Attachment, Draft};
use crate::chat::types::{
    build_user_message, new_message_id, ChatError, ConversationState, Message, MessageId,
    OpenMessage, Phase, Part,
};
use crate::error::Result;
use crate::transport::{DeltaStream, StreamDelta, Transport, TransportError};

/// What a front end needs to redraw after one step of the reply stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    PartAppended { message_id: MessageId, part: Part },
    TextExtended { message_id: MessageId, fragment: String },
    Completed { message_id: Option<MessageId> },
    Failed { message_id: Option<MessageId>, error: ChatError },
}

/// Owns the conversation, the draft and the single open reply stream.
///
/// Every method takes `&mut self`, so draft edits and stream consumption
/// are serialized by the borrow rather than by locks.
pub struct ChatSessionController {
    transport: Arc<dyn Transport>,
    state: ConversationState,
    draft: Draft,
    stream: Option<Box<dyn DeltaStream>>,
    last_error: Option<ChatError>,
}

impl ChatSessionController {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: ConversationState::new(),
            draft: Draft::new(),
            stream: None,
            last_error: None,
        }
    }

    /// Opens the chat view for a signed-in session only.
    pub fn for_session(session: &Session, transport: Arc<dyn Transport>) -> std::result::Result<Self, ChatError> {
        if !session.is_authenticated {
            return Err(ChatError::Unauthorized);
        }
        Ok(Self::new(transport))
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn can_submit(&self) -> bool {
        self.state.phase() == Phase::Idle
    }

    pub fn messages(&self) -> &[Message] {
        self.state.messages()
    }

    pub fn open_message(&self) -> Option<&OpenMessage> {
        self.state.open_message()
    }

    pub fn transcript(&self) -> Vec<Message> {
        self.state.transcript()
    }

    pub fn draft(&self) -> &Draft {
        &self.draft
    }

    pub fn last_error(&self) -> Option<&ChatError> {
        self.last_error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<ChatError> {
        self.last_error.take()
    }

    pub fn set_input(&mut self, text: impl Into<String>) {
        self.draft.set_text(text);
    }

    /// Puts an already encoded file on the draft, returning the one it replaces.
    pub fn pick_attachment(&mut self, attachment: Attachment) -> std::result::Result<Option<Attachment>, ChatError> {
        self.ensure_idle()?;
        debug!("Attached {} ({})", attachment.file_name(), attachment.media_type());
        Ok(self.draft.attach(attachment))
    }

    /// Reads and encodes `path`; completes before any later submit can run.
    pub async fn pick_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.ensure_idle()?;
        let attachment = Attachment::load(path).await?;
        self.pick_attachment(attachment)?;
        Ok(())
    }

    /// Drops the draft's attachment and its encoded preview.
    pub fn remove_attachment(&mut self) -> std::result::Result<Option<Attachment>, ChatError> {
        self.ensure_idle()?;
        Ok(self.draft.remove_attachment())
    }

    /// Validates the draft, appends it as a user message and opens the reply
    /// stream. Validation failures leave the conversation and draft untouched.
    pub async fn submit(&mut self) -> std::result::Result<(), ChatError> {
        if let Err(e) = self.ensure_idle() {
            warn!("Submit ignored while {:?}", self.state.phase());
            return Err(e);
        }
        self.last_error = None;

        let file_part = match self.draft.attachment() {
            Some(attachment) => match attachment.validate() {
                Ok(()) => Some(attachment.to_part()),
                Err(e) => return Err(self.reject(e.into())),
            },
            None => None,
        };

        let message = match build_user_message(self.draft.text().trim(), file_part) {
            Ok(message) => message,
            Err(e) => return Err(self.reject(e)),
        };

        info!("Submitting message {} with {} part(s)", message.id, message.parts.len());
        self.state.push_sealed(message);
        self.draft.clear();
        self.transition(Phase::Submitted);

        match self.transport.submit(self.state.messages()).await {
            Ok(stream) => {
                self.stream = Some(stream);
                Ok(())
            }
            Err(e) => {
                let (_, error) = self.abort(e);
                Err(error)
            }
        }
    }

    /// Applies the next delta of the open stream. `None` when nothing is in
    /// flight.
    pub async fn next_event(&mut self) -> Option<ControllerEvent> {
        let stream = self.stream.as_mut()?;
        let delta = stream.next_delta().await;
        let announced_id = stream.message_id().map(str::to_string);

        Some(match delta {
            Some(delta) => self.apply_delta(delta, announced_id),
            None => self.fail(TransportError::StreamAborted),
        })
    }

    /// Consumes the open stream until the controller is idle again.
    pub async fn run_until_idle(&mut self) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        events
    }

    /// Stops the open stream. Content already applied is kept.
    pub fn cancel(&mut self) -> Option<MessageId> {
        let mut stream = self.stream.take()?;
        stream.cancel();
        let sealed = self.state.seal_open();
        self.transition(Phase::Idle);
        info!("Reply cancelled; kept partial message {:?}", sealed);
        sealed
    }

    fn apply_delta(&mut self, delta: StreamDelta, announced_id: Option<MessageId>) -> ControllerEvent {
        if self.state.phase() == Phase::Submitted && !delta.is_terminal() {
            let id = announced_id.unwrap_or_else(new_message_id);
            debug!("First delta received; opening assistant message {}", id);
            self.state.open_assistant(id);
            self.transition(Phase::Streaming);
        }

        match delta {
            StreamDelta::PartAppended(part) => match self.state.open_mut() {
                Some(open) => {
                    open.append_part(part.clone());
                    ControllerEvent::PartAppended {
                        message_id: open.id().to_string(),
                        part,
                    }
                }
                None => self.fail(TransportError::StreamAborted),
            },
            StreamDelta::PartialTextExtended(fragment) => match self.state.open_mut() {
                Some(open) => {
                    open.extend_text(&fragment);
                    ControllerEvent::TextExtended {
                        message_id: open.id().to_string(),
                        fragment,
                    }
                }
                None => self.fail(TransportError::StreamAborted),
            },
            StreamDelta::StreamEnded => {
                self.stream = None;
                let message_id = self.state.seal_open();
                self.transition(Phase::Idle);
                info!("Reply {:?} complete", message_id);
                ControllerEvent::Completed { message_id }
            }
            StreamDelta::StreamFailed(error) => self.fail(error),
        }
    }

    fn fail(&mut self, error: TransportError) -> ControllerEvent {
        let (message_id, error) = self.abort(error);
        ControllerEvent::Failed { message_id, error }
    }

    /// Seals partial content, records the error and returns to idle.
    fn abort(&mut self, error: TransportError) -> (Option<MessageId>, ChatError) {
        if let Some(mut stream) = self.stream.take() {
            stream.cancel();
        }
        let message_id = self.state.seal_open();
        self.transition(Phase::Error);

        let error = ChatError::Transport(error);
        warn!("Reply failed: {} (kept partial message {:?})", error, message_id);
        self.last_error = Some(error.clone());
        self.transition(Phase::Idle);

        (message_id, error)
    }

    fn reject(&mut self, error: ChatError) -> ChatError {
        debug!("Draft rejected: {}", error);
        self.last_error = Some(error.clone());
        error
    }

    fn ensure_idle(&self) -> std::result::Result<(), ChatError> {
        if self.state.phase() == Phase::Idle {
            Ok(())
        } else {
            Err(ChatError::Busy)
        }
    }

    fn transition(&mut self, next: Phase) {
        let from = self.state.phase();
        if self.state.set_phase(next) {
            debug!("Phase {:?} -> {:?}", from, next);
        } else {
            warn!("Ignoring illegal phase change {:?} -> {:?}", from, next);
        }
    }
}

impl Drop for ChatSessionController {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            stream.cancel();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::account::User;
    use crate::chat::attachment::tests::PNG_BYTES;
    use crate::chat::types::MessageRole;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Replays canned deltas; a `None` script keeps the stream pending forever.
    pub(crate) struct ScriptedTransport {
        scripts: Mutex<VecDeque<Option<Vec<StreamDelta>>>>,
        pub submissions: AtomicUsize,
        pub seen: Mutex<Vec<Vec<Message>>>,
        pub cancelled: Arc<AtomicBool>,
        fail_with: Option<TransportError>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(scripts: Vec<Option<Vec<StreamDelta>>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                submissions: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                cancelled: Arc::new(AtomicBool::new(false)),
                fail_with: None,
            })
        }

        pub(crate) fn failing(error: TransportError) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(VecDeque::new()),
                submissions: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                cancelled: Arc::new(AtomicBool::new(false)),
                fail_with: Some(error),
            })
        }
    }

    struct ScriptedStream {
        deltas: Option<VecDeque<StreamDelta>>,
        cancelled: Arc<AtomicBool>,
        done: bool,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn submit(&self, messages: &[Message]) -> std::result::Result<Box<dyn DeltaStream>, TransportError> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(messages.to_vec());
            if let Some(error) = &self.fail_with {
                return Err(error.clone());
            }
            let script = self.scripts.lock().pop_front().unwrap_or(Some(Vec::new()));
            Ok(Box::new(ScriptedStream {
                deltas: script.map(VecDeque::from),
                cancelled: self.cancelled.clone(),
                done: false,
            }))
        }
    }

    #[async_trait]
    impl DeltaStream for ScriptedStream {
        async fn next_delta(&mut self) -> Option<StreamDelta> {
            if self.done {
                return None;
            }
            match self.deltas.as_mut() {
                Some(deltas) => {
                    let delta = deltas.pop_front();
                    if delta.as_ref().map_or(true, StreamDelta::is_terminal) {
                        self.done = true;
                    }
                    delta
                }
                None => std::future::pending().await,
            }
        }

        fn message_id(&self) -> Option<&str> {
            Some("assistant-1")
        }

        fn cancel(&mut self) {
            self.done = true;
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    fn text(fragment: &str) -> StreamDelta {
        StreamDelta::PartialTextExtended(fragment.to_string())
    }

    fn controller(transport: &Arc<ScriptedTransport>) -> ChatSessionController {
        ChatSessionController::new(transport.clone())
    }

    #[tokio::test]
    async fn test_successful_stream() {
        let transport = ScriptedTransport::new(vec![Some(vec![
            StreamDelta::PartAppended(Part::text("")),
            text("Hel"),
            text("lo"),
            StreamDelta::StreamEnded,
        ])]);
        let mut chat = controller(&transport);

        chat.set_input("  hi  ");
        chat.submit().await.unwrap();
        assert_eq!(chat.phase(), Phase::Submitted);
        assert!(!chat.can_submit());
        assert!(chat.draft().is_empty());

        let events = chat.run_until_idle().await;
        assert_eq!(events.len(), 4);
        assert_eq!(
            events.last(),
            Some(&ControllerEvent::Completed {
                message_id: Some("assistant-1".to_string())
            })
        );

        assert_eq!(chat.phase(), Phase::Idle);
        assert!(chat.open_message().is_none());
        let messages = chat.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].parts, vec![Part::text("hi")]);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].id, "assistant-1");
        assert_eq!(messages[1].text(), "Hello");
        assert!(chat.last_error().is_none());
    }

    #[tokio::test]
    async fn test_failure_keeps_partial_content() {
        let failure = TransportError::ServerError {
            status: 200,
            message: "An error occurred while processing your request.".to_string(),
        };
        let transport = ScriptedTransport::new(vec![Some(vec![
            text("first "),
            text("second"),
            StreamDelta::StreamFailed(failure.clone()),
        ])]);
        let mut chat = controller(&transport);

        chat.set_input("tell me");
        chat.submit().await.unwrap();

        assert!(matches!(chat.next_event().await, Some(ControllerEvent::TextExtended { .. })));
        assert_eq!(chat.phase(), Phase::Streaming);
        assert!(chat.open_message().is_some());

        let events = chat.run_until_idle().await;
        assert_eq!(
            events.last(),
            Some(&ControllerEvent::Failed {
                message_id: Some("assistant-1".to_string()),
                error: ChatError::Transport(failure.clone()),
            })
        );

        assert_eq!(chat.phase(), Phase::Idle);
        assert_eq!(chat.messages().len(), 2);
        assert_eq!(chat.messages()[1].text(), "first second");
        assert_eq!(chat.last_error(), Some(&ChatError::Transport(failure)));
        assert!(chat.can_submit());
    }

    #[tokio::test]
    async fn test_double_submit_opens_one_stream() {
        let transport = ScriptedTransport::new(vec![None]);
        let mut chat = controller(&transport);

        chat.set_input("first");
        chat.submit().await.unwrap();
        chat.set_input("second");
        assert_eq!(chat.submit().await, Err(ChatError::Busy));
        assert_eq!(chat.submit().await, Err(ChatError::Busy));

        assert_eq!(transport.submissions.load(Ordering::SeqCst), 1);
        assert_eq!(chat.messages().len(), 1);
        assert_eq!(chat.draft().text(), "second");
    }

    #[tokio::test]
    async fn test_validation_failure_does_not_reach_transport() {
        let transport = ScriptedTransport::new(vec![]);
        let mut chat = controller(&transport);

        chat.set_input("look at this");
        chat.pick_attachment(Attachment::from_bytes("a.zip", "application/zip", b"PK\x03\x04"))
            .unwrap();
        let result = chat.submit().await;

        assert!(matches!(result, Err(ChatError::Validation(_))));
        assert_eq!(chat.phase(), Phase::Idle);
        assert!(chat.messages().is_empty());
        assert_eq!(transport.submissions.load(Ordering::SeqCst), 0);
        assert!(chat.draft().attachment().is_some());
        assert!(chat.last_error().is_some());
    }

    #[tokio::test]
    async fn test_empty_draft_is_rejected_locally() {
        let transport = ScriptedTransport::new(vec![]);
        let mut chat = controller(&transport);

        chat.set_input("   ");
        assert_eq!(chat.submit().await, Err(ChatError::EmptyMessage));
        assert_eq!(transport.submissions.load(Ordering::SeqCst), 0);
        assert_eq!(chat.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_attachment_only_submission() {
        let transport = ScriptedTransport::new(vec![Some(vec![text("A cat."), StreamDelta::StreamEnded])]);
        let mut chat = controller(&transport);

        chat.pick_attachment(Attachment::from_bytes("cat.png", "image/png", PNG_BYTES))
            .unwrap();
        chat.submit().await.unwrap();
        chat.run_until_idle().await;

        let sent = transport.seen.lock()[0].clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].parts.len(), 1);
        assert!(matches!(&sent[0].parts[0], Part::File { media_type, .. } if media_type == "image/png"));
        assert!(chat.draft().attachment().is_none());
    }

    #[tokio::test]
    async fn test_pick_and_remove_only_while_idle() {
        let transport = ScriptedTransport::new(vec![None]);
        let mut chat = controller(&transport);

        chat.pick_attachment(Attachment::from_bytes("a.png", "image/png", PNG_BYTES))
            .unwrap();
        assert!(chat.remove_attachment().unwrap().is_some());
        assert!(chat.draft().attachment().is_none());

        chat.set_input("hello");
        chat.submit().await.unwrap();

        let picked = chat.pick_attachment(Attachment::from_bytes("b.png", "image/png", PNG_BYTES));
        assert_eq!(picked, Err(ChatError::Busy));
        assert_eq!(chat.remove_attachment(), Err(ChatError::Busy));
    }

    #[tokio::test]
    async fn test_cancel_keeps_partial_and_closes_stream() {
        let transport = ScriptedTransport::new(vec![Some(vec![
            text("partial"),
            text(" more"),
            StreamDelta::StreamEnded,
        ])]);
        let mut chat = controller(&transport);

        chat.set_input("go");
        chat.submit().await.unwrap();
        chat.next_event().await;

        assert_eq!(chat.cancel(), Some("assistant-1".to_string()));
        assert!(transport.cancelled.load(Ordering::SeqCst));
        assert_eq!(chat.phase(), Phase::Idle);
        assert_eq!(chat.messages()[1].text(), "partial");
        assert!(chat.next_event().await.is_none());
        assert_eq!(chat.cancel(), None);
    }

    #[tokio::test]
    async fn test_cancel_before_first_delta() {
        let transport = ScriptedTransport::new(vec![None]);
        let mut chat = controller(&transport);

        chat.set_input("go");
        chat.submit().await.unwrap();
        assert_eq!(chat.cancel(), None);
        assert_eq!(chat.phase(), Phase::Idle);
        assert_eq!(chat.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_on_submit() {
        let error = TransportError::ServerError {
            status: 400,
            message: "Unsupported file type: application/zip".to_string(),
        };
        let transport = ScriptedTransport::failing(error.clone());
        let mut chat = controller(&transport);

        chat.set_input("hi");
        assert_eq!(chat.submit().await, Err(ChatError::Transport(error)));
        assert_eq!(chat.phase(), Phase::Idle);
        assert_eq!(chat.messages().len(), 1);
        assert!(chat.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_closed_without_terminal_delta() {
        let transport = ScriptedTransport::new(vec![Some(vec![text("half")])]);
        let mut chat = controller(&transport);

        chat.set_input("go");
        chat.submit().await.unwrap();
        let events = chat.run_until_idle().await;

        assert_eq!(
            events.last(),
            Some(&ControllerEvent::Failed {
                message_id: Some("assistant-1".to_string()),
                error: ChatError::Transport(TransportError::StreamAborted),
            })
        );
        assert_eq!(chat.messages()[1].text(), "half");
    }

    #[tokio::test]
    async fn test_immediate_failure_adds_no_assistant_message() {
        let transport = ScriptedTransport::new(vec![Some(vec![StreamDelta::StreamFailed(
            TransportError::StreamAborted,
        )])]);
        let mut chat = controller(&transport);

        chat.set_input("go");
        chat.submit().await.unwrap();
        chat.run_until_idle().await;

        assert_eq!(chat.messages().len(), 1);
        assert_eq!(chat.phase(), Phase::Idle);
        assert!(chat.last_error().is_some());
    }

    #[tokio::test]
    async fn test_history_is_resent_on_next_turn() {
        let transport = ScriptedTransport::new(vec![
            Some(vec![text("one"), StreamDelta::StreamEnded]),
            Some(vec![text("two"), StreamDelta::StreamEnded]),
        ]);
        let mut chat = controller(&transport);

        chat.set_input("first");
        chat.submit().await.unwrap();
        chat.run_until_idle().await;
        chat.set_input("second");
        chat.submit().await.unwrap();
        chat.run_until_idle().await;

        let seen = transport.seen.lock();
        assert_eq!(seen[1].len(), 3);
        assert_eq!(seen[1][1].text(), "one");
        drop(seen);
        assert_eq!(chat.messages().len(), 4);
    }

    #[test]
    fn test_chat_requires_authenticated_session() {
        let transport = ScriptedTransport::new(vec![]);

        let anonymous = Session::anonymous();
        assert!(matches!(
            ChatSessionController::for_session(&anonymous, transport.clone()),
            Err(ChatError::Unauthorized)
        ));

        let signed_in = Session::authenticated(User::new("Test User", "test@example.com"));
        assert!(ChatSessionController::for_session(&signed_in, transport).is_ok());
    }
}
