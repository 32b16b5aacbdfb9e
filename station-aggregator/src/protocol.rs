//! Line-oriented wire protocol.
//!
//! Requests:
//!
//! ```text
//! PUT\n <clock>\n <header-line>*\n \n <body-line>*\n \n
//! GET\n <clock>\n <id-or-MOST_RECENT>\n
//! HEARTBEAT\n <opaque-path>\n
//! ```
//!
//! Responses are a status line, header lines, a blank line, an optional body
//! and a trailing blank line.

use std::fmt;
use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];
const STATUS_PREFIX: &str = "HTTP/1.1";

/// Sentinel id that asks for the station with the latest contact.
pub const MOST_RECENT: &str = "MOST_RECENT";

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Longest line accepted from a peer, terminator included.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// First line of every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Put,
    Get,
    Heartbeat,
}

impl Verb {
    /// Matches a request line exactly; verbs are case-sensitive.
    pub fn parse(line: &str) -> Option<Self> {
        match line {
            "PUT" => Some(Verb::Put),
            "GET" => Some(Verb::Get),
            "HEARTBEAT" => Some(Verb::Heartbeat),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Put => "PUT",
            Verb::Get => "GET",
            Verb::Heartbeat => "HEARTBEAT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Created,
    NoContent,
    BadRequest,
    NotFound,
    InternalError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Created => 201,
            Status::NoContent => 204,
            Status::BadRequest => 400,
            Status::NotFound => 404,
            Status::InternalError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Created => "Created",
            Status::NoContent => "No Content",
            Status::BadRequest => "Invalid request type",
            Status::NotFound => "Not Found",
            Status::InternalError => "Internal Server Error",
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(Status::Ok),
            201 => Some(Status::Created),
            204 => Some(Status::NoContent),
            400 => Some(Status::BadRequest),
            404 => Some(Status::NotFound),
            500 => Some(Status::InternalError),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Status::Ok | Status::Created | Status::NoContent)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// A request as a client puts it on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Put {
        clock: u64,
        headers: Vec<(String, String)>,
        payload: String,
    },
    Get {
        clock: u64,
        station: String,
    },
    Heartbeat {
        path: String,
    },
}

impl Request {
    pub fn verb(&self) -> Verb {
        match self {
            Request::Put { .. } => Verb::Put,
            Request::Get { .. } => Verb::Get,
            Request::Heartbeat { .. } => Verb::Heartbeat,
        }
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(self.verb().as_str());
        out.push('\n');
        match self {
            Request::Put {
                clock,
                headers,
                payload,
            } => {
                out.push_str(&format!("{clock}\n"));
                for (name, value) in headers {
                    out.push_str(&format!("{name}: {value}\n"));
                }
                out.push('\n');
                if !payload.is_empty() {
                    out.push_str(payload);
                    out.push('\n');
                }
                out.push('\n');
            }
            Request::Get { clock, station } => {
                out.push_str(&format!("{clock}\n{station}\n"));
            }
            Request::Heartbeat { path } => {
                out.push_str(path);
                out.push('\n');
            }
        }
        out
    }
}

/// A response on either side of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl Response {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: None,
        }
    }

    /// A response carrying a JSON body with matching content headers.
    pub fn json(status: Status, body: impl Into<String>) -> Self {
        let body = body.into();
        Self {
            status,
            headers: vec![
                ("Content-Type".to_string(), CONTENT_TYPE_JSON.to_string()),
                ("Content-Length".to_string(), body.len().to_string()),
            ],
            body: Some(body),
        }
    }

    /// A 404 whose body names the reason in a small JSON object.
    pub fn not_found(reason: &str) -> Self {
        Self::json(Status::NotFound, format!("{{\"error\": \"{reason}\"}}"))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn encode(&self) -> String {
        let mut out = format!("{STATUS_PREFIX} {}\n", self.status);
        for (name, value) in &self.headers {
            out.push_str(&format!("{name}: {value}\n"));
        }
        out.push('\n');
        if let Some(body) = &self.body {
            out.push_str(body);
            out.push('\n');
        }
        out.push('\n');
        out
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(self.encode().as_bytes()).await?;
        writer.flush().await
    }

    /// Reads a full response; the peer closes the stream after the body.
    ///
    /// With a `Content-Length` header the body is exactly that many bytes;
    /// otherwise whatever precedes end-of-stream, minus trailing newlines.
    pub async fn read_from<R>(reader: &mut R) -> io::Result<Self>
    where
        R: AsyncBufRead + Unpin,
    {
        let status_line = read_line(reader)
            .await?
            .ok_or_else(|| invalid_data("connection closed before status line"))?;
        let status = parse_status_line(&status_line)?;

        let mut headers = Vec::new();
        for line in read_block(reader).await? {
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }

        let declared = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("Content-Length"))
            .and_then(|(_, value)| value.parse::<usize>().ok());

        let body = match declared {
            Some(length) => {
                let mut bytes = vec![0; length];
                reader.read_exact(&mut bytes).await?;
                Some(String::from_utf8(bytes).map_err(invalid_data)?)
            }
            None => {
                let mut rest = String::new();
                reader.read_to_string(&mut rest).await?;
                let rest = rest.trim_end_matches(LINE_ENDINGS);
                (!rest.is_empty()).then(|| rest.to_string())
            }
        };

        Ok(Self {
            status,
            headers,
            body,
        })
    }
}

/// Reads one line as raw bytes without its terminator; `None` at end of
/// stream.
///
/// Lines longer than [`MAX_LINE_BYTES`] fail with `InvalidData` after at most
/// that many bytes have been buffered.
pub async fn read_raw_line<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let bytes = (&mut *reader)
        .take(MAX_LINE_BYTES as u64 + 1)
        .read_until(b'\n', &mut line)
        .await?;
    if bytes == 0 {
        return Ok(None);
    }
    if line.len() > MAX_LINE_BYTES {
        return Err(invalid_data(format!("line exceeds {MAX_LINE_BYTES} bytes")));
    }
    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.pop();
    }
    Ok(Some(line))
}

/// Reads one UTF-8 line without its terminator; `None` at end of stream.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    match read_raw_line(reader).await? {
        Some(bytes) => String::from_utf8(bytes).map(Some).map_err(invalid_data),
        None => Ok(None),
    }
}

/// Reads lines up to a blank line or end of stream.
pub async fn read_block<R>(reader: &mut R) -> io::Result<Vec<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();
    while let Some(line) = read_line(reader).await? {
        if line.is_empty() {
            break;
        }
        lines.push(line);
    }
    Ok(lines)
}

fn parse_status_line(line: &str) -> io::Result<Status> {
    let mut parts = line.split_whitespace();
    let first = parts.next().unwrap_or_default();
    let code = if first.starts_with("HTTP/") {
        parts.next().unwrap_or_default()
    } else {
        first
    };
    code.parse::<u16>()
        .ok()
        .and_then(Status::from_code)
        .ok_or_else(|| invalid_data(format!("unrecognised status line: {line:?}")))
}

fn invalid_data<E>(err: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, err)
}
