//! Attachment encoding and the validation rules shared by the client's
//! pre-submit check and the endpoint's authoritative check.
//!
//! Both sides call [`validate`] with the same constants, so a payload the
//! client accepts is accepted by the server and vice versa.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use thiserror::Error;

/// Media types accepted for `File` parts.
pub const SUPPORTED_MEDIA_TYPES: [&str; 4] = ["image/jpeg", "image/png", "image/gif", "image/webp"];

pub const MAX_ATTACHMENT_MB: u64 = 5;
pub const MAX_ATTACHMENT_BYTES: u64 = MAX_ATTACHMENT_MB * 1024 * 1024;

const DATA_URI_SCHEME: &str = "data:";
const BASE64_MARKER: &str = ";base64";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Unsupported file type: {media_type}")]
    UnsupportedType { media_type: String },

    #[error("Invalid image data: {reason}")]
    MalformedPayload { reason: PayloadDefect },

    #[error("Image too large: {size_bytes} bytes exceeds the {limit_bytes} byte limit")]
    TooLarge { size_bytes: u64, limit_bytes: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadDefect {
    NotDataUrl,
    MissingContent,
    NotBase64,
}

impl std::fmt::Display for PayloadDefect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadDefect::NotDataUrl => write!(f, "not a data URL"),
            PayloadDefect::MissingContent => write!(f, "missing content"),
            PayloadDefect::NotBase64 => write!(f, "content is not valid base64"),
        }
    }
}

impl ValidationError {
    /// Longer explanation meant for the person who picked the file.
    pub fn details(&self) -> String {
        match self {
            ValidationError::UnsupportedType { media_type } => {
                let shown = if media_type.is_empty() { "unknown" } else { media_type.as_str() };
                format!(
                    "The provided file type ('{}') is not supported. Please upload one of the following formats: {}.",
                    shown,
                    supported_formats()
                )
            }
            ValidationError::MalformedPayload { reason: PayloadDefect::MissingContent } => {
                "The image data URL is missing its content.".to_string()
            }
            ValidationError::MalformedPayload { reason: PayloadDefect::NotBase64 } => {
                "The image data could not be decoded.".to_string()
            }
            ValidationError::MalformedPayload { .. } => {
                "The image data URL is improperly formatted.".to_string()
            }
            ValidationError::TooLarge { size_bytes, .. } => {
                let size_mb = *size_bytes as f64 / 1024.0 / 1024.0;
                format!(
                    "The image size ({:.1}MB) exceeds the maximum limit of {}MB.",
                    size_mb, MAX_ATTACHMENT_MB
                )
            }
        }
    }
}

/// `JPEG, PNG, GIF, WEBP`
pub fn supported_formats() -> String {
    SUPPORTED_MEDIA_TYPES
        .iter()
        .map(|media_type| media_type.trim_start_matches("image/").to_uppercase())
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn is_supported(media_type: &str) -> bool {
    SUPPORTED_MEDIA_TYPES.contains(&media_type)
}

/// Encodes raw bytes as `data:<media_type>;base64,<data>`.
pub fn encode(media_type: &str, bytes: &[u8]) -> String {
    format!("{}{}{},{}", DATA_URI_SCHEME, media_type, BASE64_MARKER, STANDARD.encode(bytes))
}

/// Inverse of [`encode`]: returns the declared media type and the decoded bytes.
pub fn decode(payload: &str) -> Result<(String, Vec<u8>), ValidationError> {
    let (header, data) = split_data_uri(payload)?;
    let media_type = header.trim_end_matches(BASE64_MARKER).to_string();
    let bytes = STANDARD.decode(data).map_err(|_| ValidationError::MalformedPayload {
        reason: PayloadDefect::NotBase64,
    })?;
    Ok((media_type, bytes))
}

/// The base64 segment of a data URL, undecoded.
pub fn base64_data(payload: &str) -> Result<&str, ValidationError> {
    split_data_uri(payload).map(|(_, data)| data)
}

/// Byte length implied by the base64 segment, computed as
/// `floor(len * 3 / 4)` without decoding. Padding is not subtracted; the
/// client and server must agree on this exact figure.
pub fn decode_size_bytes(payload: &str) -> u64 {
    let data = payload.split(',').nth(1).unwrap_or(payload);
    size_from_base64_len(data.len())
}

pub fn size_from_base64_len(len: usize) -> u64 {
    (len as u64 * 3) / 4
}

/// Checks media type membership, data-URL shape and the size ceiling, in
/// that order, stopping at the first violation.
pub fn validate(media_type: &str, payload: &str) -> Result<(), ValidationError> {
    if !is_supported(media_type) {
        return Err(ValidationError::UnsupportedType {
            media_type: media_type.to_string(),
        });
    }

    let (_, data) = split_data_uri(payload)?;

    let size_bytes = size_from_base64_len(data.len());
    if size_bytes > MAX_ATTACHMENT_BYTES {
        return Err(ValidationError::TooLarge {
            size_bytes,
            limit_bytes: MAX_ATTACHMENT_BYTES,
        });
    }

    Ok(())
}

fn split_data_uri(payload: &str) -> Result<(&str, &str), ValidationError> {
    let rest = payload.strip_prefix(DATA_URI_SCHEME).ok_or(ValidationError::MalformedPayload {
        reason: PayloadDefect::NotDataUrl,
    })?;

    // The base64 segment ends at the next comma, if any.
    let split = rest
        .split_once(',')
        .map(|(header, tail)| (header, tail.split(',').next().unwrap_or_default()));
    match split {
        Some((header, data)) if !data.is_empty() => Ok((header, data)),
        _ => Err(ValidationError::MalformedPayload {
            reason: PayloadDefect::MissingContent,
        }),
    }
}

/// Identifies the allow-listed image formats by their leading bytes.
pub fn sniff_media_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

/// Content sniffing first, then the file extension, then a generic binary type.
pub fn media_type_for(path: &Path, bytes: &[u8]) -> String {
    if let Some(media_type) = sniff_media_type(bytes) {
        return media_type.to_string();
    }

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("zip") => "application/zip",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
    .to_string()
}
