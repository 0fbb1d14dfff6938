pub mod attachment;
pub mod controller;
pub mod draft;
pub mod types;

pub use attachment::{ValidationError, MAX_ATTACHMENT_BYTES, SUPPORTED_MEDIA_TYPES};
pub use controller::{ChatSessionController, ControllerEvent};
pub use draft::{Attachment, Draft};
pub use types::{
    build_user_message, ChatError, ConversationState, Message, MessageId, MessageRole,
    OpenMessage, Part, Phase,
};
