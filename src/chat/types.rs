use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chat::attachment::ValidationError;
use crate::transport::TransportError;

pub type MessageId = String;

pub fn new_message_id() -> MessageId {
    Uuid::new_v4().to_string()
}

/// One turn of the conversation. Sealed messages are never mutated; the
/// assistant reply being streamed lives in [`OpenMessage`] until it is sealed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: MessageRole,
    pub parts: Vec<Part>,
}

impl Message {
    pub fn new(role: MessageRole, parts: Vec<Part>) -> Self {
        Self {
            id: new_message_id(),
            role,
            parts,
        }
    }

    /// All text parts joined by newlines, the way a message bubble shows them.
    pub fn text(&self) -> String {
        self.text_parts().collect::<Vec<_>>().join("\n")
    }

    pub fn text_parts(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(Part::as_text)
    }

    /// File parts that carry an image, in part order.
    pub fn image_parts(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter().filter(|part| {
            matches!(part, Part::File { media_type, .. } if media_type.starts_with("image/"))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "assistant")]
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Part {
    Text {
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    File {
        #[serde(default)]
        media_type: String,
        payload: String,
    },
}

impl Part {
    pub fn text(content: impl Into<String>) -> Self {
        Part::Text {
            content: content.into(),
        }
    }

    pub fn file(media_type: impl Into<String>, payload: impl Into<String>) -> Self {
        Part::File {
            media_type: media_type.into(),
            payload: payload.into(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { content } => Some(content),
            Part::File { .. } => None,
        }
    }
}

/// Builds the user's turn from trimmed draft text and an optional file part.
///
/// Empty text produces no text part; text, when present, precedes the file.
pub fn build_user_message(text: &str, attachment: Option<Part>) -> Result<Message, ChatError> {
    let mut parts = Vec::with_capacity(2);
    if !text.is_empty() {
        parts.push(Part::text(text));
    }
    if let Some(file) = attachment {
        parts.push(file);
    }

    if parts.is_empty() {
        return Err(ChatError::EmptyMessage);
    }

    Ok(Message::new(MessageRole::User, parts))
}

/// The assistant reply while it is still streaming.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenMessage {
    id: MessageId,
    parts: Vec<Part>,
}

impl OpenMessage {
    pub fn new(id: MessageId) -> Self {
        Self {
            id,
            parts: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn append_part(&mut self, part: Part) {
        self.parts.push(part);
    }

    /// Extends the trailing text part, or starts one when the last part is
    /// not text.
    pub fn extend_text(&mut self, fragment: &str) {
        match self.parts.last_mut() {
            Some(Part::Text { content }) => content.push_str(fragment),
            _ => self.parts.push(Part::text(fragment)),
        }
    }

    pub fn seal(self) -> Message {
        Message {
            id: self.id,
            role: MessageRole::Assistant,
            parts: self.parts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Submitted,
    Streaming,
    Error,
}

impl Phase {
    pub fn can_transition_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Idle, Phase::Submitted)
                | (Phase::Submitted, Phase::Streaming)
                | (Phase::Submitted, Phase::Error)
                | (Phase::Submitted, Phase::Idle)
                | (Phase::Streaming, Phase::Idle)
                | (Phase::Streaming, Phase::Error)
                | (Phase::Error, Phase::Idle)
        )
    }

    pub fn is_busy(self) -> bool {
        matches!(self, Phase::Submitted | Phase::Streaming)
    }
}

/// Sealed history plus at most one open assistant reply.
#[derive(Debug)]
pub struct ConversationState {
    messages: Vec<Message>,
    open: Option<OpenMessage>,
    phase: Phase,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationState {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            open: None,
            phase: Phase::Idle,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn open_message(&self) -> Option<&OpenMessage> {
        self.open.as_ref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, next: Phase) -> bool {
        if !self.phase.can_transition_to(next) {
            return false;
        }
        self.phase = next;
        true
    }

    pub(crate) fn push_sealed(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Opens the assistant reply; returns the existing one if already open.
    pub(crate) fn open_assistant(&mut self, id: MessageId) -> &mut OpenMessage {
        self.open.get_or_insert_with(|| OpenMessage::new(id))
    }

    pub(crate) fn open_mut(&mut self) -> Option<&mut OpenMessage> {
        self.open.as_mut()
    }

    /// Moves the open reply, with whatever it holds, into sealed history.
    /// A reply that never received a part is dropped instead.
    pub(crate) fn seal_open(&mut self) -> Option<MessageId> {
        let open = self.open.take()?;
        if open.parts.is_empty() {
            return None;
        }
        let message = open.seal();
        let id = message.id.clone();
        self.messages.push(message);
        Some(id)
    }

    /// Sealed messages followed by a snapshot of the open reply.
    pub fn transcript(&self) -> Vec<Message> {
        let mut transcript = self.messages.clone();
        if let Some(open) = &self.open {
            transcript.push(open.clone().seal());
        }
        transcript
    }
}

/// Errors specific to a single submission
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChatError {
    #[error("Message is empty: type something or attach an image")]
    EmptyMessage,

    #[error("A reply is still streaming; wait for it to finish")]
    Busy,

    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("Sign in to use the chat")]
    Unauthorized,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn some_attachment() -> Part {
        Part::file("image/png", "data:image/png;base64,aGk=")
    }

    #[test]
    fn test_attachment_only_message() {
        let message = build_user_message("", Some(some_attachment())).unwrap();
        assert_eq!(message.role, MessageRole::User);
        assert_eq!(message.parts.len(), 1);
        assert!(matches!(message.parts[0], Part::File { .. }));
        assert_eq!(message.text_parts().count(), 0);
    }

    #[test]
    fn test_text_precedes_file() {
        let message = build_user_message("hi", Some(some_attachment())).unwrap();
        assert_eq!(message.parts, vec![Part::text("hi"), some_attachment()]);
    }

    #[test]
    fn test_empty_message_is_rejected() {
        assert_eq!(build_user_message("", None), Err(ChatError::EmptyMessage));
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = build_user_message("a", None).unwrap();
        let b = build_user_message("a", None).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_part_wire_shape() {
        let value = serde_json::to_value(Part::text("hello")).unwrap();
        assert_eq!(value, json!({"type": "text", "content": "hello"}));

        let value = serde_json::to_value(some_attachment()).unwrap();
        assert_eq!(
            value,
            json!({"type": "file", "mediaType": "image/png", "payload": "data:image/png;base64,aGk="})
        );

        let part: Part = serde_json::from_value(json!({"type": "file", "payload": "x"})).unwrap();
        assert_eq!(part, Part::file("", "x"));
    }

    #[test]
    fn test_open_message_accumulates_and_seals() {
        let mut open = OpenMessage::new("assistant-1".to_string());
        open.extend_text("Hel");
        open.extend_text("lo");
        open.append_part(Part::text(""));
        open.extend_text("again");

        let sealed = open.seal();
        assert_eq!(sealed.role, MessageRole::Assistant);
        assert_eq!(sealed.parts, vec![Part::text("Hello"), Part::text("again")]);
        assert_eq!(sealed.text(), "Hello\nagain");
    }

    #[test]
    fn test_image_parts_filter() {
        let message = Message::new(
            MessageRole::User,
            vec![Part::text("look"), some_attachment(), Part::file("application/pdf", "data:x")],
        );
        assert_eq!(message.image_parts().count(), 1);
    }

    #[test]
    fn test_phase_transitions() {
        assert!(Phase::Idle.can_transition_to(Phase::Submitted));
        assert!(Phase::Submitted.can_transition_to(Phase::Streaming));
        assert!(Phase::Streaming.can_transition_to(Phase::Idle));
        assert!(Phase::Streaming.can_transition_to(Phase::Error));
        assert!(Phase::Error.can_transition_to(Phase::Idle));

        assert!(!Phase::Idle.can_transition_to(Phase::Streaming));
        assert!(!Phase::Streaming.can_transition_to(Phase::Submitted));
        assert!(!Phase::Error.can_transition_to(Phase::Streaming));
    }

    #[test]
    fn test_conversation_state_single_open_message() {
        let mut state = ConversationState::new();
        state.open_assistant("a".to_string()).extend_text("one");
        state.open_assistant("b".to_string()).extend_text(" two");

        let open = state.open_message().unwrap();
        assert_eq!(open.id(), "a");
        assert_eq!(open.parts(), &[Part::text("one two")]);

        assert_eq!(state.seal_open(), Some("a".to_string()));
        assert!(state.open_message().is_none());
        assert_eq!(state.messages().len(), 1);
        assert_eq!(state.seal_open(), None);
    }

    #[test]
    fn test_empty_open_message_is_discarded() {
        let mut state = ConversationState::new();
        state.open_assistant("a".to_string());
        assert_eq!(state.seal_open(), None);
        assert!(state.messages().is_empty());
    }
}
