use memchr::memchr;
use serde::{Deserialize, Serialize};

use crate::chat::types::Part;

/// One event of the `/api/chat` response body, sent as `data: <json>\n\n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    #[serde(rename_all = "camelCase")]
    Start {
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },
    PartAppended {
        part: Part,
    },
    TextDelta {
        delta: String,
    },
    Finish,
    #[serde(rename_all = "camelCase")]
    Error {
        error_text: String,
    },
}

pub fn encode_frame(frame: &Frame) -> serde_json::Result<String> {
    Ok(format!("data: {}\n\n", serde_json::to_string(frame)?))
}

/// Reassembles frames from arbitrarily split body chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete frame in the buffer, skipping blank lines, comments and
    /// non-data fields.
    pub fn next_frame(&mut self) -> Option<serde_json::Result<Frame>> {
        while let Some(newline_pos) = memchr(b'\n', &self.buffer) {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            if let Some(result) = parse_line(&line) {
                return Some(result);
            }
        }
        None
    }

    /// Parses whatever is left once the body has ended without a final newline.
    pub fn finish(&mut self) -> Option<serde_json::Result<Frame>> {
        if let Some(result) = self.next_frame() {
            return Some(result);
        }
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }
}

fn parse_line(line: &[u8]) -> Option<serde_json::Result<Frame>> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }

    let payload = line.strip_prefix("data:")?.trim_start();
    Some(serde_json::from_str(payload))
}
