//! Just enough HTTP/1.1 for one JSON endpoint: a request line, headers, a
//! `Content-Length` body, and JSON or chunked responses. Every connection
//! carries a single request.

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_LINE_BYTES: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    PayloadTooLarge,
    InternalServerError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::NotFound => 404,
            Status::MethodNotAllowed => 405,
            Status::PayloadTooLarge => 413,
            Status::InternalServerError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::PayloadTooLarge => "Payload Too Large",
            Status::InternalServerError => "Internal Server Error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Content-Length header is required")]
    MissingLength,

    #[error("Body of {declared} bytes exceeds the {limit} byte limit")]
    TooLarge { declared: u64, limit: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RequestError {
    pub fn status(&self) -> Status {
        match self {
            RequestError::TooLarge { .. } => Status::PayloadTooLarge,
            _ => Status::BadRequest,
        }
    }
}

/// Reads one request. `Ok(None)` when the peer closed before sending anything.
pub async fn read_request<R>(reader: &mut R, max_body_bytes: u64) -> Result<Option<Request>, RequestError>
where
    R: AsyncBufRead + Unpin,
{
    let Some(request_line) = read_line(reader).await? else {
        return Ok(None);
    };

    let mut fields = request_line.split_whitespace();
    let (method, target) = match (fields.next(), fields.next(), fields.next()) {
        (Some(method), Some(target), Some(version)) if version.starts_with("HTTP/1.") => {
            (method.to_string(), target)
        }
        _ => return Err(RequestError::Malformed(format!("bad request line {:?}", request_line))),
    };
    let path = target.split('?').next().unwrap_or(target).to_string();

    let mut headers = Vec::new();
    loop {
        let line = read_line(reader)
            .await?
            .ok_or_else(|| RequestError::Malformed("connection closed inside headers".to_string()))?;
        if line.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADERS {
            return Err(RequestError::Malformed("too many headers".to_string()));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| RequestError::Malformed(format!("bad header line {:?}", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let mut request = Request {
        method,
        path,
        headers,
        body: Vec::new(),
    };

    let declared = match request.header("content-length") {
        Some(value) => value
            .parse::<u64>()
            .map_err(|_| RequestError::Malformed(format!("bad Content-Length {:?}", value)))?,
        None if request.method == "POST" => return Err(RequestError::MissingLength),
        None => 0,
    };
    if declared > max_body_bytes {
        return Err(RequestError::TooLarge {
            declared,
            limit: max_body_bytes,
        });
    }

    let mut body = Vec::with_capacity(declared as usize);
    (&mut *reader).take(declared).read_to_end(&mut body).await?;
    if (body.len() as u64) < declared {
        return Err(RequestError::Malformed("body shorter than Content-Length".to_string()));
    }
    request.body = body;

    Ok(Some(request))
}

/// One CRLF- or LF-terminated line without its terminator.
async fn read_line<R>(reader: &mut R) -> Result<Option<String>, RequestError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(MAX_LINE_BYTES as u64 + 1)
        .read_until(b'\n', &mut line)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if line.len() > MAX_LINE_BYTES {
        return Err(RequestError::Malformed("line too long".to_string()));
    }
    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.pop();
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|_| RequestError::Malformed("header is not UTF-8".to_string()))
}

/// Writes a complete JSON response and closes the exchange.
pub async fn write_json<W, T>(writer: &mut W, status: Status, body: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(body)?;
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status.code(),
        status.reason(),
        body.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// A `Transfer-Encoding: chunked` response body, flushed chunk by chunk.
pub struct ChunkedWriter<'a, W> {
    writer: &'a mut W,
}

impl<'a, W> ChunkedWriter<'a, W>
where
    W: AsyncWrite + Unpin,
{
    pub async fn begin(writer: &'a mut W, status: Status, content_type: &str) -> std::io::Result<Self> {
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nCache-Control: no-cache\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
            status.code(),
            status.reason(),
            content_type
        );
        writer.write_all(head.as_bytes()).await?;
        writer.flush().await?;
        Ok(Self { writer })
    }

    pub async fn write_chunk(&mut self, data: &[u8]) -> std::io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.writer
            .write_all(format!("{:x}\r\n", data.len()).as_bytes())
            .await?;
        self.writer.write_all(data).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await
    }

    pub async fn finish(self) -> std::io::Result<()> {
        self.writer.write_all(b"0\r\n\r\n").await?;
        self.writer.flush().await
    }
}
