//! Topic encoding for mirrored traffic.
//!
//! A topic names one direction of a conversation as `SRC-DST`, where each side
//! is `a.b.c.d:port` or `[v6]:port`. Mirrored messages are framed as
//! `TOPIC:\r\nPAYLOAD`, and an empty payload marks the end of that stream.
//!
//! The same topic bytes double as the subscription filter on the mirror bus, so
//! subscribing to `10.0.0.1` receives everything sent from that address.
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Separator between a topic and its payload.
pub const TOPIC_SEPARATOR: &[u8] = b":\r\n";

/// Direction of a mirrored stream relative to the endpoint that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
  /// Bytes leaving this endpoint towards its partner
  Uplink,
  /// Bytes arriving at this endpoint from its partner
  Downlink,
}

/// Render an address the way it appears inside a topic.
///
/// IPv6 addresses are bracketed and never carry a scope id; IPv4-mapped
/// addresses are rendered as plain IPv4.
pub fn endpoint_bytes(addr: &SocketAddr) -> Bytes {
  let text = match addr.ip() {
    IpAddr::V4(ip) => format!("{}:{}", ip, addr.port()),
    IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
      Some(v4) => format!("{}:{}", v4, addr.port()),
      None => format!("[{}]:{}", ip, addr.port()),
    },
  };
  Bytes::from(text)
}

/// `SRC-DST` routing key of one mirrored stream.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Topic(Bytes);

impl Topic {
  /// Build the topic for traffic seen by the endpoint at `this` whose partner is `other`.
  pub fn encode(direction: Direction, this: &SocketAddr, other: &SocketAddr) -> Topic {
    let (src, dst) = match direction {
      Direction::Uplink => (this, other),
      Direction::Downlink => (other, this),
    };
    let src = endpoint_bytes(src);
    let dst = endpoint_bytes(dst);
    let mut buf = BytesMut::with_capacity(src.len() + dst.len() + 1);
    buf.put_slice(&src);
    buf.put_u8(b'-');
    buf.put_slice(&dst);
    Topic(buf.freeze())
  }

  /// Raw topic bytes
  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }

  /// Frame `payload` under this topic.
  pub fn wrap(&self, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(self.0.len() + TOPIC_SEPARATOR.len() + payload.len());
    buf.put_slice(&self.0);
    buf.put_slice(TOPIC_SEPARATOR);
    buf.put_slice(payload);
    buf.freeze()
  }

  /// End-of-stream sentinel for this topic.
  pub fn eof(&self) -> Bytes {
    self.wrap(&[])
  }
}

impl AsRef<[u8]> for Topic {
  fn as_ref(&self) -> &[u8] {
    &self.0
  }
}

impl fmt::Debug for Topic {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Topic({})", String::from_utf8_lossy(&self.0))
  }
}

impl fmt::Display for Topic {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&String::from_utf8_lossy(&self.0))
  }
}

/// One side of a decoded topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicEndpoint {
  host: String,
  port: u16,
}

impl TopicEndpoint {
  /// Host as written in the topic, IPv6 keeps its brackets
  pub fn host(&self) -> &str {
    &self.host
  }

  /// Bare IP text, without brackets
  pub fn ip(&self) -> &str {
    self.host.trim_start_matches('[').trim_end_matches(']')
  }

  /// Port
  pub fn port(&self) -> u16 {
    self.port
  }

  /// `host:port`, the form used for subscriptions
  pub fn full(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }

  /// The socket address, when the host is a valid IP literal
  pub fn socket_addr(&self) -> Option<SocketAddr> {
    let ip: IpAddr = self.ip().parse().ok()?;
    Some(SocketAddr::new(ip, self.port))
  }
}

/// Source and destination of a mirrored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTopic {
  /// sender side
  pub src: TopicEndpoint,
  /// receiver side
  pub dst: TopicEndpoint,
}

/// Parse the topic prefix of a mirrored message.
///
/// Returns `None` for anything that does not follow the topic grammar; callers
/// treat such messages as inert.
pub fn decode(msg: &[u8]) -> Option<DecodedTopic> {
  let mut cursor = Cursor::new(msg);
  let src = cursor.endpoint()?;
  cursor.expect(b'-')?;
  let dst = cursor.endpoint()?;
  if !cursor.rest().starts_with(TOPIC_SEPARATOR) {
    return None;
  }
  Some(DecodedTopic { src, dst })
}

/// Payload of a mirrored message, `None` when the message has no valid topic.
pub fn payload(msg: &[u8]) -> Option<&[u8]> {
  let mut cursor = Cursor::new(msg);
  cursor.endpoint()?;
  cursor.expect(b'-')?;
  cursor.endpoint()?;
  cursor.rest().strip_prefix(TOPIC_SEPARATOR)
}

/// Whether `msg` is the end-of-stream sentinel of its topic.
pub fn is_eof(msg: &[u8]) -> bool {
  matches!(payload(msg), Some(p) if p.is_empty())
}

/// Extract the bare IP of a subscription token (`ip` or `ip:port`).
pub fn endpoint_ip(token: &[u8]) -> Option<&str> {
  let mut cursor = Cursor::new(token);
  let host = cursor.host()?;
  if !cursor.rest().is_empty() {
    cursor.expect(b':')?;
    cursor.port()?;
    if !cursor.rest().is_empty() {
      return None;
    }
  }
  let host = std::str::from_utf8(host).ok()?;
  Some(host.trim_start_matches('[').trim_end_matches(']'))
}

/// Bus filter for a subscription token, matching messages sent by it.
///
/// A bare IP becomes `ip:` and a full address `ip:port-`, so `10.0.0.1` never
/// picks up traffic from `10.0.0.10` and `:80` never matches `:8080`.
pub fn subscription_prefix(token: &[u8]) -> Option<Vec<u8>> {
  let mut cursor = Cursor::new(token);
  cursor.host()?;
  let delimiter = if cursor.rest().is_empty() {
    b':'
  } else {
    cursor.expect(b':')?;
    cursor.port()?;
    if !cursor.rest().is_empty() {
      return None;
    }
    b'-'
  };
  let mut prefix = Vec::with_capacity(token.len() + 1);
  prefix.extend_from_slice(token);
  prefix.push(delimiter);
  Some(prefix)
}

struct Cursor<'a> {
  buf: &'a [u8],
  pos: usize,
}

impl<'a> Cursor<'a> {
  fn new(buf: &'a [u8]) -> Self {
    Self { buf, pos: 0 }
  }

  fn rest(&self) -> &'a [u8] {
    &self.buf[self.pos..]
  }

  fn peek(&self) -> Option<u8> {
    self.buf.get(self.pos).copied()
  }

  fn expect(&mut self, byte: u8) -> Option<()> {
    if self.peek()? == byte {
      self.pos += 1;
      Some(())
    } else {
      None
    }
  }

  fn take_while(&mut self, pred: impl Fn(u8) -> bool) -> usize {
    let start = self.pos;
    while matches!(self.peek(), Some(b) if pred(b)) {
      self.pos += 1;
    }
    self.pos - start
  }

  fn digits(&mut self) -> Option<()> {
    (self.take_while(|b| b.is_ascii_digit()) > 0).then_some(())
  }

  // `d+(.d+){3}` or `[hex-and-colons]`
  fn host(&mut self) -> Option<&'a [u8]> {
    let start = self.pos;
    if self.peek()? == b'[' {
      self.pos += 1;
      if self.take_while(|b| b == b':' || b.is_ascii_hexdigit()) == 0 {
        return None;
      }
      self.expect(b']')?;
    } else {
      self.digits()?;
      for _ in 0..3 {
        self.expect(b'.')?;
        self.digits()?;
      }
    }
    Some(&self.buf[start..self.pos])
  }

  fn port(&mut self) -> Option<u16> {
    let start = self.pos;
    let n = self.take_while(|b| b.is_ascii_digit());
    if n == 0 || n > 5 {
      return None;
    }
    std::str::from_utf8(&self.buf[start..self.pos])
      .ok()?
      .parse()
      .ok()
  }

  fn endpoint(&mut self) -> Option<TopicEndpoint> {
    let host = self.host()?;
    self.expect(b':')?;
    let port = self.port()?;
    Some(TopicEndpoint {
      host: String::from_utf8_lossy(host).into_owned(),
      port,
    })
  }
}
