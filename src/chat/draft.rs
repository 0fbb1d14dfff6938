use std::path::Path;

use tracing::debug;

use crate::chat::attachment::{self, ValidationError};
use crate::chat::types::Part;
use crate::error::{Error, Result};

/// A picked file, already encoded. The encoded payload is also what a
/// front end renders as the preview, so dropping the attachment releases it.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    file_name: String,
    media_type: String,
    size_bytes: u64,
    payload: String,
}

impl Attachment {
    /// Reads and encodes a file. Encoding runs on the blocking pool so large
    /// images do not stall the event loop.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = tokio::fs::read(&path).await?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        let media_type = attachment::media_type_for(&path, &bytes);
        debug!("Encoding {} ({}, {} bytes)", file_name, media_type, bytes.len());

        tokio::task::spawn_blocking(move || Self::from_bytes(file_name, media_type, &bytes))
            .await
            .map_err(|e| Error::unknown(format!("Attachment encoding task failed: {}", e)))
    }

    pub fn from_bytes(file_name: impl Into<String>, media_type: impl Into<String>, bytes: &[u8]) -> Self {
        let media_type = media_type.into();
        let payload = attachment::encode(&media_type, bytes);
        Self {
            file_name: file_name.into(),
            media_type,
            size_bytes: bytes.len() as u64,
            payload,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        attachment::validate(&self.media_type, &self.payload)
    }

    pub fn to_part(&self) -> Part {
        Part::file(self.media_type.clone(), self.payload.clone())
    }
}

/// The user's input before it becomes a message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Draft {
    text: String,
    attachment: Option<Attachment>,
}

impl Draft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    /// Replaces the attachment, returning the previous one.
    pub fn attach(&mut self, attachment: Attachment) -> Option<Attachment> {
        self.attachment.replace(attachment)
    }

    pub fn remove_attachment(&mut self) -> Option<Attachment> {
        self.attachment.take()
    }

    /// True when trimmed text is empty and nothing is attached.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.attachment.is_none()
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.attachment = None;
    }
}
