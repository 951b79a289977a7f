//! HTTP/1.x message heads and bodies, as much as a forwarding proxy needs.
use crate::errors::{new_io_error, Error, Result};
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use std::collections::HashSet;
use std::io::ErrorKind;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Largest request or response head accepted
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Largest request body buffered before forwarding
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;
const MAX_CHUNK_LINE: u64 = 1024;
const READ_CHUNK: usize = 8192;

/// Headers that never cross the proxy, in addition to those a
/// `Connection`/`Proxy-Connection` header names.
const HOP_BY_HOP: [&str; 12] = [
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "proxy-connection",
  "te",
  "trailers",
  "transfer-encoding",
  "upgrade",
  "content-encoding",
  "content-length",
  "accept-encoding",
];

/// Request line and headers
#[derive(Debug, Clone)]
pub struct RequestHead {
  /// request method
  pub method: Method,
  /// request target exactly as sent
  pub target: String,
  /// protocol version
  pub version: Version,
  /// header fields
  pub headers: HeaderMap,
}

/// Status line and headers
#[derive(Debug, Clone)]
pub struct ResponseHead {
  /// status code
  pub status: StatusCode,
  /// protocol version
  pub version: Version,
  /// header fields
  pub headers: HeaderMap,
}

/// `HTTP/1.0` or `HTTP/1.1`
pub fn version_str(version: Version) -> &'static str {
  if version == Version::HTTP_10 {
    "HTTP/1.0"
  } else {
    "HTTP/1.1"
  }
}

fn parse_version(s: &str) -> Result<Version> {
  match s {
    "HTTP/1.1" => Ok(Version::HTTP_11),
    "HTTP/1.0" => Ok(Version::HTTP_10),
    _ => Err(Error::protocol_error(format!("unsupported HTTP version: {}", s))),
  }
}

async fn read_head_lines<R>(reader: &mut R) -> Result<Option<Vec<Vec<u8>>>>
where
  R: AsyncBufRead + Unpin,
{
  let mut lines = Vec::new();
  let mut budget = MAX_HEAD_SIZE as u64;
  loop {
    if budget == 0 {
      return Err(Error::protocol_error("message head too large"));
    }
    let mut line = Vec::new();
    let n = (&mut *reader).take(budget).read_until(b'\n', &mut line).await?;
    if n == 0 && lines.is_empty() {
      return Ok(None);
    }
    budget -= n as u64;
    if !line.ends_with(b"\n") {
      if budget == 0 {
        return Err(Error::protocol_error("message head too large"));
      }
      return Err(Error::protocol_error("connection closed inside message head"));
    }
    while matches!(line.last(), Some(b'\n' | b'\r')) {
      line.pop();
    }
    if line.is_empty() {
      if lines.is_empty() {
        // blank lines ahead of a message are tolerated
        continue;
      }
      return Ok(Some(lines));
    }
    lines.push(line);
  }
}

fn parse_headers(lines: &[Vec<u8>]) -> Result<HeaderMap> {
  let mut headers = HeaderMap::new();
  for line in lines {
    let colon = line
      .iter()
      .position(|b| *b == b':')
      .ok_or_else(|| Error::protocol_error("header line without a colon"))?;
    let name = HeaderName::from_bytes(line[..colon].trim_ascii())
      .map_err(|_| Error::protocol_error("invalid header name"))?;
    let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii())
      .map_err(|_| Error::protocol_error("invalid header value"))?;
    headers.append(name, value);
  }
  Ok(headers)
}

/// Read a request head, `None` when the client closed before sending one.
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>>
where
  R: AsyncBufRead + Unpin,
{
  let Some(lines) = read_head_lines(reader).await? else {
    return Ok(None);
  };
  let (first, rest) = lines
    .split_first()
    .ok_or_else(|| Error::protocol_error("empty request"))?;
  let line = std::str::from_utf8(first).map_err(|_| Error::protocol_error("request line is not UTF-8"))?;
  let mut parts = line.split_whitespace();
  let (Some(method), Some(target), Some(version), None) =
    (parts.next(), parts.next(), parts.next(), parts.next())
  else {
    return Err(Error::protocol_error(format!("invalid request line: {}", line)));
  };
  let method = Method::from_bytes(method.as_bytes())
    .map_err(|_| Error::protocol_error(format!("invalid method: {}", method)))?;
  Ok(Some(RequestHead {
    method,
    target: target.to_string(),
    version: parse_version(version)?,
    headers: parse_headers(rest)?,
  }))
}

/// Read a response head
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
  R: AsyncBufRead + Unpin,
{
  let lines = read_head_lines(reader)
    .await?
    .ok_or_else(|| Error::protocol_error("upstream closed before responding"))?;
  let (first, rest) = lines
    .split_first()
    .ok_or_else(|| Error::protocol_error("empty response"))?;
  let line = String::from_utf8_lossy(first);
  let mut parts = line.splitn(3, ' ');
  let version = parse_version(parts.next().unwrap_or_default())?;
  let status = parts
    .next()
    .and_then(|code| StatusCode::from_bytes(code.as_bytes()).ok())
    .ok_or_else(|| Error::protocol_error(format!("invalid status line: {}", line)))?;
  Ok(ResponseHead {
    status,
    version,
    headers: parse_headers(rest)?,
  })
}

/// Drop hop-by-hop and encoding negotiation headers.
pub fn cleanup_headers(headers: &HeaderMap) -> HeaderMap {
  let mut removed: HashSet<String> = HOP_BY_HOP.iter().map(|h| h.to_string()).collect();
  for name in [CONNECTION.as_str(), "proxy-connection"] {
    for value in headers.get_all(name) {
      if let Ok(value) = value.to_str() {
        removed.extend(
          value
            .split(',')
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty()),
        );
      }
    }
  }
  let mut cleaned = HeaderMap::with_capacity(headers.len());
  for (name, value) in headers {
    if !removed.contains(name.as_str()) {
      cleaned.append(name.clone(), value.clone());
    }
  }
  cleaned
}

/// Body is not transformed by a content coding
pub fn is_identity(headers: &HeaderMap) -> bool {
  match headers.get(CONTENT_ENCODING) {
    None => true,
    Some(value) => value
      .to_str()
      .map(|v| v.to_ascii_lowercase().contains("identity"))
      .unwrap_or(false),
  }
}

/// [`cleanup_headers`], then `Content-Length` put back for identity bodies.
pub fn restore_headers(headers: &HeaderMap) -> HeaderMap {
  let mut restored = cleanup_headers(headers);
  if is_identity(headers) {
    if let Some(length) = headers.get(CONTENT_LENGTH) {
      restored.insert(CONTENT_LENGTH, length.clone());
    }
  }
  restored
}

/// Append `name: value` lines
pub fn write_headers(buf: &mut Vec<u8>, headers: &HeaderMap) {
  for (name, value) in headers {
    buf.extend_from_slice(name.as_str().as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
  }
}

/// Response head as sent by the proxy
pub fn response_head_bytes(version: Version, status: StatusCode, headers: &HeaderMap) -> Vec<u8> {
  let mut buf = format!(
    "{} {} {}\r\n",
    version_str(version),
    status.as_u16(),
    status.canonical_reason().unwrap_or("Unknown")
  )
  .into_bytes();
  write_headers(&mut buf, headers);
  buf
}

/// Complete error response; the connection is closed after it.
pub fn error_response(version: Version, status: StatusCode) -> Vec<u8> {
  let body = format!(
    "{} {}\n",
    status.as_u16(),
    status.canonical_reason().unwrap_or("Unknown")
  );
  let mut buf = response_head_bytes(version, status, &HeaderMap::new());
  buf.extend_from_slice(b"Content-Type: text/plain\r\n");
  buf.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
  buf.extend_from_slice(b"Connection: close\r\n\r\n");
  buf.extend_from_slice(body.as_bytes());
  buf
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers.get_all(TRANSFER_ENCODING).iter().any(|value| {
    value
      .to_str()
      .ok()
      .and_then(|v| v.rsplit(',').next())
      .map(|last| last.trim().eq_ignore_ascii_case("chunked"))
      .unwrap_or(false)
  })
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
  match headers.get(CONTENT_LENGTH) {
    None => Ok(None),
    Some(value) => value
      .to_str()
      .ok()
      .and_then(|v| v.trim().parse().ok())
      .map(Some)
      .ok_or_else(|| Error::protocol_error("invalid Content-Length")),
  }
}

/// How a message body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
  /// no body
  Empty,
  /// exactly this many bytes
  Length(u64),
  /// chunked transfer coding
  Chunked,
  /// until the connection closes
  UntilClose,
}

impl BodyKind {
  /// Body framing of a request
  pub fn of_request(headers: &HeaderMap) -> Result<Self> {
    if is_chunked(headers) {
      return Ok(BodyKind::Chunked);
    }
    Ok(match content_length(headers)? {
      Some(0) | None => BodyKind::Empty,
      Some(n) => BodyKind::Length(n),
    })
  }

  /// Body framing of a response to a `method` request
  pub fn of_response(method: &Method, status: StatusCode, headers: &HeaderMap) -> Result<Self> {
    if method == Method::HEAD
      || status.is_informational()
      || status == StatusCode::NO_CONTENT
      || status == StatusCode::NOT_MODIFIED
    {
      return Ok(BodyKind::Empty);
    }
    if is_chunked(headers) {
      return Ok(BodyKind::Chunked);
    }
    Ok(match content_length(headers)? {
      Some(0) => BodyKind::Empty,
      Some(n) => BodyKind::Length(n),
      None => BodyKind::UntilClose,
    })
  }
}

/// Incremental body decoder; chunked bodies come out de-chunked.
#[derive(Debug)]
pub struct BodyReader {
  kind: BodyKind,
  chunk_left: Option<u64>,
  done: bool,
  buf: Vec<u8>,
}

impl BodyReader {
  /// Decoder for a body framed as `kind`
  pub fn new(kind: BodyKind) -> Self {
    BodyReader {
      kind,
      chunk_left: None,
      done: kind == BodyKind::Empty,
      buf: vec![0u8; READ_CHUNK],
    }
  }

  /// Next piece of body data, `None` at the end of the body.
  pub async fn next_chunk<R>(&mut self, reader: &mut R) -> Result<Option<Bytes>>
  where
    R: AsyncBufRead + Unpin,
  {
    if self.done {
      return Ok(None);
    }
    match self.kind {
      BodyKind::Empty => Ok(None),
      BodyKind::Length(left) => {
        if left == 0 {
          self.done = true;
          return Ok(None);
        }
        let want = left.min(READ_CHUNK as u64) as usize;
        let n = reader.read(&mut self.buf[..want]).await?;
        if n == 0 {
          return Err(new_io_error(ErrorKind::UnexpectedEof, "body ended early"));
        }
        self.kind = BodyKind::Length(left - n as u64);
        Ok(Some(Bytes::copy_from_slice(&self.buf[..n])))
      }
      BodyKind::UntilClose => {
        let n = reader.read(&mut self.buf).await?;
        if n == 0 {
          self.done = true;
          return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(&self.buf[..n])))
      }
      BodyKind::Chunked => self.next_chunked(reader).await,
    }
  }

  async fn next_chunked<R>(&mut self, reader: &mut R) -> Result<Option<Bytes>>
  where
    R: AsyncBufRead + Unpin,
  {
    let left = match self.chunk_left {
      Some(left) => left,
      None => {
        let line = read_chunk_line(reader).await?;
        let size = line.split(';').next().unwrap_or_default().trim();
        let size = u64::from_str_radix(size, 16)
          .map_err(|_| Error::protocol_error(format!("invalid chunk size: {}", size)))?;
        if size == 0 {
          // trailer section
          while !read_chunk_line(reader).await?.is_empty() {}
          self.done = true;
          return Ok(None);
        }
        size
      }
    };
    let want = left.min(READ_CHUNK as u64) as usize;
    let n = reader.read(&mut self.buf[..want]).await?;
    if n == 0 {
      return Err(new_io_error(ErrorKind::UnexpectedEof, "chunk ended early"));
    }
    let left = left - n as u64;
    if left == 0 {
      read_chunk_line(reader).await?;
      self.chunk_left = None;
    } else {
      self.chunk_left = Some(left);
    }
    Ok(Some(Bytes::copy_from_slice(&self.buf[..n])))
  }
}

async fn read_chunk_line<R>(reader: &mut R) -> Result<String>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  (&mut *reader)
    .take(MAX_CHUNK_LINE)
    .read_until(b'\n', &mut line)
    .await?;
  if !line.ends_with(b"\n") {
    return Err(Error::protocol_error("malformed chunk framing"));
  }
  Ok(String::from_utf8_lossy(&line).trim_end().to_string())
}

/// Read a whole request body of at most `limit` bytes
pub async fn read_body<R>(reader: &mut R, kind: BodyKind, limit: usize) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  if let BodyKind::Length(n) = kind {
    if n > limit as u64 {
      return Err(Error::PayloadTooLarge(limit));
    }
  }
  let mut body = Vec::new();
  let mut decoder = BodyReader::new(kind);
  while let Some(chunk) = decoder.next_chunk(reader).await? {
    if body.len() + chunk.len() > limit {
      return Err(Error::PayloadTooLarge(limit));
    }
    body.extend_from_slice(&chunk);
  }
  Ok(body)
}
