//! SOCKS5 relay
//!
//! [`Socks5Machine`] is the negotiation state machine. It owns the bytes
//! received so far and turns them into [`Action`]s, without touching a socket.
//! [`Socks5Server`] drives one machine per accepted connection and hands the
//! connection over to a [`Pipe`] once the upstream connect succeeds.
use crate::bus::BusPublisher;
use crate::errors::{Error, ReplyCode, Result};
use crate::pipe::{Endpoint, Pipe, Role};
use bytes::{Buf, Bytes, BytesMut};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_NO_AUTHENTICATION: u8 = 0x00;
const SOCKS5_NO_ACCEPTABLE_METHODS: u8 = 0xFF;

const SOCKS5_CMD_CONNECT: u8 = 0x01;

const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;

/// Client bytes held while the upstream connect is in flight
pub const MAX_EARLY_DATA: usize = 64 * 1024;

/// SOCKS5 target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
  /// IPv4 address
  Ipv4(Ipv4Addr, u16),
  /// Domain name
  Domain(String, u16),
}

impl TargetAddr {
  /// Get host (without port)
  pub fn host(&self) -> String {
    match self {
      TargetAddr::Ipv4(ip, _) => ip.to_string(),
      TargetAddr::Domain(domain, _) => domain.clone(),
    }
  }

  /// Get port
  pub fn port(&self) -> u16 {
    match self {
      TargetAddr::Ipv4(_, port) | TargetAddr::Domain(_, port) => *port,
    }
  }

  async fn connect(&self) -> std::io::Result<TcpStream> {
    match self {
      TargetAddr::Ipv4(ip, port) => TcpStream::connect((*ip, *port)).await,
      TargetAddr::Domain(domain, port) => TcpStream::connect((domain.as_str(), *port)).await,
    }
  }
}

impl fmt::Display for TargetAddr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.host(), self.port())
  }
}

/// Negotiation state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
  /// waiting for version, method count and methods
  AwaitingMethodSelection,
  /// waiting for a complete CONNECT request
  AwaitingConnectRequest,
  /// upstream connect in flight, client bytes are buffered
  Connecting(TargetAddr),
  /// bytes belong to the pipe now
  Streaming,
  /// negotiation failed or the connection is gone
  Closed,
}

/// What the driver must do after feeding bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
  /// write these bytes to the client
  Reply(Bytes),
  /// open the upstream connection
  Connect(TargetAddr),
  /// close the client connection
  Close,
}

/// Reply to a CONNECT request, with the fixed `0.0.0.0:0` bound address.
pub fn reply(code: ReplyCode) -> Bytes {
  Bytes::copy_from_slice(&[
    SOCKS5_VERSION,
    code.as_u8(),
    0x00, // Reserved
    SOCKS5_ATYP_IPV4,
    0x00,
    0x00,
    0x00,
    0x00, // Bind address (0.0.0.0)
    0x00,
    0x00, // Bind port (0)
  ])
}

/// SOCKS5 negotiation state machine.
///
/// Bytes that are not consumed by one state stay buffered and are handed to
/// the next state immediately, so the split of the input into reads never
/// changes the outcome.
#[derive(Debug)]
pub struct Socks5Machine {
  state: State,
  buf: BytesMut,
}

impl Default for Socks5Machine {
  fn default() -> Self {
    Self::new()
  }
}

impl Socks5Machine {
  /// A machine waiting for the method selection message
  pub fn new() -> Self {
    Socks5Machine {
      state: State::AwaitingMethodSelection,
      buf: BytesMut::with_capacity(512),
    }
  }

  /// Current state
  pub fn state(&self) -> &State {
    &self.state
  }

  /// Bytes received but not consumed yet
  pub fn buffered(&self) -> &[u8] {
    &self.buf
  }

  /// Feed bytes read from the client.
  pub fn feed(&mut self, data: &[u8]) -> Vec<Action> {
    let mut actions = Vec::new();
    match self.state {
      State::Closed | State::Streaming => return actions,
      _ => self.buf.extend_from_slice(data),
    }
    loop {
      let advanced = match self.state {
        State::AwaitingMethodSelection => self.method_selection(&mut actions),
        State::AwaitingConnectRequest => self.connect_request(&mut actions),
        _ => false,
      };
      if !advanced {
        break;
      }
    }
    if matches!(self.state, State::Connecting(_)) && self.buf.len() > MAX_EARLY_DATA {
      let reason = format!(
        "more than {} bytes sent before the upstream connected",
        MAX_EARLY_DATA
      );
      self.reject(&mut actions, None, reason);
    }
    actions
  }

  /// Upstream is connected; returns the success reply and the client bytes
  /// that arrived behind the request.
  pub fn connected(&mut self) -> Result<(Bytes, Bytes)> {
    if !matches!(self.state, State::Connecting(_)) {
      return Err(Error::protocol_error(format!(
        "SOCKS5 connect completed in state {:?}",
        self.state
      )));
    }
    self.state = State::Streaming;
    Ok((reply(ReplyCode::Succeeded), self.buf.split().freeze()))
  }

  /// Upstream connect failed or was abandoned
  pub fn connect_failed(&mut self) {
    self.close();
  }

  fn close(&mut self) {
    self.state = State::Closed;
    self.buf.clear();
  }

  fn reject(&mut self, actions: &mut Vec<Action>, reply: Option<Bytes>, reason: String) -> bool {
    tracing::debug!("[SOCKS5] {}", reason);
    if let Some(reply) = reply {
      actions.push(Action::Reply(reply));
    }
    actions.push(Action::Close);
    self.close();
    false
  }

  fn method_selection(&mut self, actions: &mut Vec<Action>) -> bool {
    if self.buf.len() < 2 {
      return false;
    }
    if self.buf[0] != SOCKS5_VERSION {
      let version = self.buf[0];
      return self.reject(
        actions,
        Some(Bytes::from_static(&[SOCKS5_VERSION, SOCKS5_NO_ACCEPTABLE_METHODS])),
        format!("Unsupported SOCKS version: {}", version),
      );
    }
    let nmethods = self.buf[1] as usize;
    if self.buf.len() < 2 + nmethods {
      return false;
    }
    self.buf.advance(2 + nmethods);
    actions.push(Action::Reply(Bytes::from_static(&[
      SOCKS5_VERSION,
      SOCKS5_NO_AUTHENTICATION,
    ])));
    self.state = State::AwaitingConnectRequest;
    true
  }

  fn connect_request(&mut self, actions: &mut Vec<Action>) -> bool {
    // VER CMD RSV ATYP and the first address byte
    if self.buf.len() < 5 {
      return false;
    }
    let (version, cmd, atyp) = (self.buf[0], self.buf[1], self.buf[3]);
    if version != SOCKS5_VERSION {
      return self.reject(
        actions,
        Some(reply(ReplyCode::GeneralFailure)),
        format!("Invalid SOCKS version in request: {}", version),
      );
    }
    if cmd != SOCKS5_CMD_CONNECT {
      return self.reject(
        actions,
        Some(reply(ReplyCode::CommandNotSupported)),
        format!("Unsupported command: {}", cmd),
      );
    }
    let addr_len = match atyp {
      SOCKS5_ATYP_IPV4 => 4,
      SOCKS5_ATYP_DOMAIN => self.buf[4] as usize + 1,
      SOCKS5_ATYP_IPV6 => {
        return self.reject(
          actions,
          Some(reply(ReplyCode::AddressTypeNotSupported)),
          "IPv6 targets are not supported".to_string(),
        )
      }
      _ => {
        return self.reject(
          actions,
          Some(reply(ReplyCode::AddressTypeNotSupported)),
          format!("Unsupported address type: {}", atyp),
        )
      }
    };
    let total = 4 + addr_len + 2;
    if self.buf.len() < total {
      return false;
    }
    let addr = &self.buf[4..4 + addr_len];
    let port = u16::from_be_bytes([self.buf[total - 2], self.buf[total - 1]]);
    let target = if atyp == SOCKS5_ATYP_IPV4 {
      TargetAddr::Ipv4(Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]), port)
    } else {
      let name = &addr[1..];
      if name.is_empty() || !name.is_ascii() {
        return self.reject(
          actions,
          Some(reply(ReplyCode::GeneralFailure)),
          "Invalid domain name".to_string(),
        );
      }
      TargetAddr::Domain(String::from_utf8_lossy(name).into_owned(), port)
    };
    self.buf.advance(total);
    actions.push(Action::Connect(target.clone()));
    self.state = State::Connecting(target);
    // the remainder stays buffered until the pipe exists
    false
  }
}

/// SOCKS5 relay service
#[derive(Debug, Clone)]
pub struct Socks5Server {
  mirror: Option<BusPublisher>,
  connect_timeout: Duration,
}

impl Socks5Server {
  /// Relay connections, mirroring to `mirror` when given.
  pub fn new(mirror: Option<BusPublisher>, connect_timeout: Duration) -> Self {
    Socks5Server {
      mirror,
      connect_timeout,
    }
  }

  /// Accept connections forever
  pub async fn run(&self, listener: TcpListener) -> Result<()> {
    loop {
      match listener.accept().await {
        Ok((stream, peer_addr)) => {
          let server = self.clone();
          tokio::spawn(async move {
            if let Err(e) = server.handle_connection(stream, peer_addr).await {
              tracing::debug!("[SOCKS5] {} closed: {}", peer_addr, e);
            }
          });
        }
        Err(e) => {
          tracing::error!("[SOCKS5] Failed to accept connection: {}", e);
        }
      }
    }
  }

  /// Negotiate with one client and relay its connection.
  pub async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut machine = Socks5Machine::new();
    let mut buf = vec![0u8; 1024];

    let target = 'negotiate: loop {
      let n = reader.read(&mut buf).await?;
      if n == 0 {
        return Ok(());
      }
      let mut target = None;
      for action in machine.feed(&buf[..n]) {
        match action {
          Action::Reply(bytes) => writer.write_all(&bytes).await?,
          Action::Close => {
            let _ = writer.shutdown().await;
            return Ok(());
          }
          Action::Connect(addr) => target = Some(addr),
        }
      }
      if let Some(target) = target {
        break 'negotiate target;
      }
    };
    tracing::debug!("[SOCKS5] {} CONNECT {}", peer_addr, target);

    let connect = tokio::time::timeout(self.connect_timeout, target.connect());
    tokio::pin!(connect);
    let upstream = loop {
      tokio::select! {
        result = &mut connect => match result {
          Ok(Ok(stream)) => break stream,
          Ok(Err(e)) => {
            machine.connect_failed();
            return Err(Error::upstream_connect(target.to_string(), e));
          }
          Err(_) => {
            machine.connect_failed();
            let e = std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out");
            return Err(Error::upstream_connect(target.to_string(), e));
          }
        },
        read = reader.read(&mut buf) => match read {
          Ok(0) | Err(_) => {
            // client left, the pending connect is dropped with this future
            machine.connect_failed();
            tracing::debug!("[SOCKS5] {} went away while connecting to {}", peer_addr, target);
            return Ok(());
          }
          Ok(n) => {
            if machine.feed(&buf[..n]).contains(&Action::Close) {
              return Ok(());
            }
          }
        },
      }
    };

    let upstream_addr = upstream.peer_addr()?;
    let (upstream_reader, upstream_writer) = upstream.into_split();
    let (reply, early_data) = machine.connected()?;
    let upstream_ep = Endpoint::new(upstream_addr, Role::Upstream, upstream_writer);
    let client_ep = Endpoint::new(peer_addr, Role::Client, writer);
    let pipe = Pipe::attach(upstream_ep, client_ep.clone(), self.mirror.clone())?;

    let started = match client_ep.write_raw(&reply).await {
      Ok(()) if early_data.is_empty() => Ok(()),
      Ok(()) => pipe.forward(&client_ep, &early_data).await,
      Err(e) => Err(e),
    };
    if let Err(e) = started {
      pipe.close().await;
      return Err(e);
    }
    pipe.run(upstream_reader, reader).await;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const METHOD_SELECTION: &[u8] = &[0x05, 0x01, 0x00];
  const CONNECT_LOCALHOST_80: &[u8] = &[0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50];

  fn replies(actions: &[Action]) -> Vec<u8> {
    actions
      .iter()
      .filter_map(|a| match a {
        Action::Reply(b) => Some(b.to_vec()),
        _ => None,
      })
      .flatten()
      .collect()
  }

  #[test]
  fn negotiates_ipv4_connect() {
    let mut machine = Socks5Machine::new();
    let actions = machine.feed(METHOD_SELECTION);
    assert_eq!(actions, vec![Action::Reply(Bytes::from_static(&[0x05, 0x00]))]);
    assert_eq!(machine.state(), &State::AwaitingConnectRequest);

    let target = TargetAddr::Ipv4(Ipv4Addr::LOCALHOST, 80);
    let actions = machine.feed(CONNECT_LOCALHOST_80);
    assert_eq!(actions, vec![Action::Connect(target.clone())]);
    assert_eq!(machine.state(), &State::Connecting(target));

    let (reply, early) = machine.connected().unwrap();
    assert_eq!(&reply[..], &[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    assert!(early.is_empty());
    assert_eq!(machine.state(), &State::Streaming);
  }

  #[test]
  fn domain_target_with_trailing_data() {
    let mut input = METHOD_SELECTION.to_vec();
    input.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, 11]);
    input.extend_from_slice(b"example.com");
    input.extend_from_slice(&443u16.to_be_bytes());
    input.extend_from_slice(b"\x16\x03\x01");

    let mut machine = Socks5Machine::new();
    let actions = machine.feed(&input);
    assert_eq!(replies(&actions), vec![0x05, 0x00]);
    assert!(actions.contains(&Action::Connect(TargetAddr::Domain(
      "example.com".to_string(),
      443
    ))));
    assert_eq!(machine.buffered(), b"\x16\x03\x01");

    machine.feed(b"more");
    let (_, early) = machine.connected().unwrap();
    assert_eq!(&early[..], b"\x16\x03\x01more");
  }

  #[test]
  fn early_data_is_capped_while_connecting() {
    let mut machine = Socks5Machine::new();
    machine.feed(METHOD_SELECTION);
    machine.feed(CONNECT_LOCALHOST_80);
    assert!(machine.feed(&vec![0u8; MAX_EARLY_DATA]).is_empty());
    assert_eq!(machine.buffered().len(), MAX_EARLY_DATA);

    assert_eq!(machine.feed(b"x"), vec![Action::Close]);
    assert_eq!(machine.state(), &State::Closed);
    assert!(machine.buffered().is_empty());
    assert!(machine.connected().is_err());
  }

  #[test]
  fn any_split_reaches_the_same_state() {
    let mut input = METHOD_SELECTION.to_vec();
    input.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, 9]);
    input.extend_from_slice(b"localhost");
    input.extend_from_slice(&8080u16.to_be_bytes());
    input.extend_from_slice(b"GET / HTTP/1.0\r\n\r\n");

    let mut whole = Socks5Machine::new();
    let whole_actions = whole.feed(&input);

    for chunk in 1..input.len() {
      let mut machine = Socks5Machine::new();
      let mut actions = Vec::new();
      for piece in input.chunks(chunk) {
        actions.extend(machine.feed(piece));
      }
      assert_eq!(actions, whole_actions, "chunk size {}", chunk);
      assert_eq!(machine.state(), whole.state(), "chunk size {}", chunk);
      assert_eq!(machine.buffered(), whole.buffered(), "chunk size {}", chunk);
    }
    // split at every single boundary pair too
    for a in 1..input.len() {
      for b in a..input.len() {
        let mut machine = Socks5Machine::new();
        let mut actions = machine.feed(&input[..a]);
        actions.extend(machine.feed(&input[a..b]));
        actions.extend(machine.feed(&input[b..]));
        assert_eq!(actions, whole_actions);
        assert_eq!(machine.buffered(), whole.buffered());
      }
    }
  }

  #[test]
  fn wrong_version_is_rejected() {
    let mut machine = Socks5Machine::new();
    let actions = machine.feed(&[0x04, 0x01, 0x00]);
    assert_eq!(
      actions,
      vec![
        Action::Reply(Bytes::from_static(&[0x05, 0xFF])),
        Action::Close
      ]
    );
    assert_eq!(machine.state(), &State::Closed);
    assert!(machine.feed(METHOD_SELECTION).is_empty());
  }

  #[test]
  fn unsupported_command_and_address_type_get_error_replies() {
    let mut machine = Socks5Machine::new();
    machine.feed(METHOD_SELECTION);
    let actions = machine.feed(&[0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0, 80]);
    assert_eq!(
      actions,
      vec![
        Action::Reply(reply(ReplyCode::CommandNotSupported)),
        Action::Close
      ]
    );

    let mut machine = Socks5Machine::new();
    machine.feed(METHOD_SELECTION);
    let mut request = vec![0x05, 0x01, 0x00, 0x04];
    request.extend_from_slice(&[0u8; 18]);
    let actions = machine.feed(&request);
    assert_eq!(
      actions,
      vec![
        Action::Reply(reply(ReplyCode::AddressTypeNotSupported)),
        Action::Close
      ]
    );
    assert_eq!(machine.state(), &State::Closed);
  }

  #[test]
  fn failed_connect_closes() {
    let mut machine = Socks5Machine::new();
    machine.feed(METHOD_SELECTION);
    machine.feed(CONNECT_LOCALHOST_80);
    machine.connect_failed();
    assert_eq!(machine.state(), &State::Closed);
    assert!(machine.connected().is_err());
  }
}
