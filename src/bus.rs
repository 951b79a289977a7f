//! Mirror bus
//!
//! The broker owns three listeners:
//!
//! - **publish**: proxy workers connect here and push mirrored messages
//! - **subscribe**: watcher sessions connect here, send subscription control
//!   frames and receive the messages whose topic matches a subscribed prefix
//! - **capture**: receives every published message, unfiltered
//!
//! Every socket on the bus speaks the same framing: a 4-byte big-endian length
//! followed by the payload. Subscription control frames start with `0x01`
//! (subscribe) or `0x00` (unsubscribe), followed by the topic prefix.
//!
//! The broker never looks inside a payload; topics are produced by the relay
//! pipe and interpreted by watchers.
use crate::config::BusConfig;
use crate::errors::{new_io_error, Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};

/// Largest frame accepted on any bus socket.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
const FRAME_HEADER_LEN: usize = 4;
const CONTROL_SUBSCRIBE: u8 = 0x01;
const CONTROL_UNSUBSCRIBE: u8 = 0x00;
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  if payload.len() > MAX_FRAME_SIZE {
    return Err(Error::protocol_error(format!(
      "frame of {} bytes exceeds the bus limit",
      payload.len()
    )));
  }
  let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
  buf.put_u32(payload.len() as u32);
  buf.put_slice(payload);
  writer.write_all(&buf).await?;
  Ok(())
}

/// Buffered reader of length-prefixed frames.
///
/// [`FrameReader::next_frame`] keeps partial frames in its own buffer, so it can
/// be raced in `tokio::select!` without losing bytes.
pub struct FrameReader<R> {
  inner: R,
  buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
  /// Wrap a reader
  pub fn new(inner: R) -> Self {
    Self {
      inner,
      buf: BytesMut::with_capacity(8192),
    }
  }

  /// Next complete frame, `None` on a clean end of stream.
  pub async fn next_frame(&mut self) -> Result<Option<Bytes>> {
    loop {
      if let Some(frame) = self.parse_frame()? {
        return Ok(Some(frame));
      }
      if self.inner.read_buf(&mut self.buf).await? == 0 {
        if self.buf.is_empty() {
          return Ok(None);
        }
        return Err(new_io_error(
          ErrorKind::UnexpectedEof,
          "bus connection closed inside a frame",
        ));
      }
    }
  }

  fn parse_frame(&mut self) -> Result<Option<Bytes>> {
    if self.buf.len() < FRAME_HEADER_LEN {
      return Ok(None);
    }
    let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
    if len > MAX_FRAME_SIZE {
      return Err(Error::protocol_error(format!(
        "frame of {} bytes exceeds the bus limit",
        len
      )));
    }
    if self.buf.len() < FRAME_HEADER_LEN + len {
      self.buf.reserve(FRAME_HEADER_LEN + len - self.buf.len());
      return Ok(None);
    }
    self.buf.advance(FRAME_HEADER_LEN);
    Ok(Some(self.buf.split_to(len).freeze()))
  }
}

/// Refcounted set of topic prefixes held by one subscriber connection.
#[derive(Debug, Default)]
pub struct Subscriptions {
  prefixes: HashMap<Bytes, usize>,
}

impl Subscriptions {
  /// Add one reference to `prefix`
  pub fn subscribe(&mut self, prefix: Bytes) {
    *self.prefixes.entry(prefix).or_insert(0) += 1;
  }

  /// Drop one reference to `prefix`, returns false when it was not subscribed
  pub fn unsubscribe(&mut self, prefix: &[u8]) -> bool {
    match self.prefixes.get_mut(prefix) {
      Some(count) if *count > 1 => {
        *count -= 1;
        true
      }
      Some(_) => {
        self.prefixes.remove(prefix);
        true
      }
      None => false,
    }
  }

  /// Whether any subscribed prefix starts `msg`
  pub fn matches(&self, msg: &[u8]) -> bool {
    self.prefixes.keys().any(|prefix| msg.starts_with(prefix))
  }

  /// Number of distinct prefixes
  pub fn len(&self) -> usize {
    self.prefixes.len()
  }

  /// No subscriptions held
  pub fn is_empty(&self) -> bool {
    self.prefixes.is_empty()
  }

  fn apply(&mut self, control: &[u8]) {
    match control.split_first() {
      Some((&CONTROL_SUBSCRIBE, prefix)) => self.subscribe(Bytes::copy_from_slice(prefix)),
      Some((&CONTROL_UNSUBSCRIBE, prefix)) => {
        self.unsubscribe(prefix);
      }
      _ => tracing::debug!("[BUS] ignoring control frame {:?}", control),
    }
  }
}

/// Mirror bus broker with its listeners bound.
pub struct Broker {
  publish: TcpListener,
  subscribe: TcpListener,
  capture: Option<TcpListener>,
  capacity: usize,
}

impl Broker {
  /// Bind the publish, subscribe and (optional) capture listeners.
  pub async fn bind(config: &BusConfig) -> Result<Self> {
    let publish = bind_listener(&config.publish_address).await?;
    let subscribe = bind_listener(&config.subscribe_address).await?;
    let capture = match config.capture_address.as_deref() {
      Some(addr) if !addr.is_empty() => Some(bind_listener(addr).await?),
      _ => None,
    };
    tracing::debug!("[BUS] publish = {:?}", publish.local_addr());
    tracing::debug!("[BUS] subscribe = {:?}", subscribe.local_addr());
    tracing::debug!(
      "[BUS] capture = {:?}",
      capture.as_ref().map(|l| l.local_addr())
    );
    Ok(Self {
      publish,
      subscribe,
      capture,
      capacity: config.queue_capacity.max(1),
    })
  }

  /// Address publishers connect to
  pub fn publish_addr(&self) -> Result<SocketAddr> {
    Ok(self.publish.local_addr()?)
  }

  /// Address subscribers connect to
  pub fn subscribe_addr(&self) -> Result<SocketAddr> {
    Ok(self.subscribe.local_addr()?)
  }

  /// Address capture consumers connect to
  pub fn capture_addr(&self) -> Result<Option<SocketAddr>> {
    match &self.capture {
      Some(listener) => Ok(Some(listener.local_addr()?)),
      None => Ok(None),
    }
  }

  /// Serve forever.
  pub async fn run(self) -> Result<()> {
    let (tx, _) = broadcast::channel::<Bytes>(self.capacity);

    let publish = {
      let tx = tx.clone();
      accept_loop(self.publish, "publish", move |stream, peer| {
        let tx = tx.clone();
        async move { handle_publisher(stream, peer, tx).await }
      })
    };
    let subscribe = {
      let tx = tx.clone();
      accept_loop(self.subscribe, "subscribe", move |stream, peer| {
        let rx = tx.subscribe();
        async move { handle_subscriber(stream, peer, rx, false).await }
      })
    };
    match self.capture {
      Some(capture) => {
        let capture = accept_loop(capture, "capture", move |stream, peer| {
          let rx = tx.subscribe();
          async move { handle_subscriber(stream, peer, rx, true).await }
        });
        tokio::join!(publish, subscribe, capture);
      }
      None => {
        tokio::join!(publish, subscribe);
      }
    }
    Ok(())
  }
}

async fn bind_listener(addr: &str) -> Result<TcpListener> {
  TcpListener::bind(addr).await.map_err(|e| {
    tracing::error!("[BUS] Failed to bind to {}: {}", addr, e);
    Error::IO(e)
  })
}

async fn accept_loop<F, Fut>(listener: TcpListener, name: &'static str, handler: F)
where
  F: Fn(TcpStream, SocketAddr) -> Fut,
  Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
  loop {
    match listener.accept().await {
      Ok((stream, peer)) => {
        tracing::debug!("[BUS] new {} connection from {}", name, peer);
        let fut = handler(stream, peer);
        tokio::spawn(async move {
          if let Err(e) = fut.await {
            tracing::debug!("[BUS] {} connection {} closed: {}", name, peer, e);
          }
        });
      }
      Err(e) => {
        tracing::error!("[BUS] Failed to accept {} connection: {}", name, e);
      }
    }
  }
}

async fn handle_publisher(
  stream: TcpStream,
  peer: SocketAddr,
  tx: broadcast::Sender<Bytes>,
) -> Result<()> {
  let mut reader = FrameReader::new(stream);
  while let Some(frame) = reader.next_frame().await? {
    // no receivers is fine, nobody is watching
    let _ = tx.send(frame);
  }
  tracing::debug!("[BUS] publisher {} disconnected", peer);
  Ok(())
}

async fn handle_subscriber(
  stream: TcpStream,
  peer: SocketAddr,
  mut rx: broadcast::Receiver<Bytes>,
  capture: bool,
) -> Result<()> {
  let (read_half, mut write_half) = stream.into_split();
  let mut control = FrameReader::new(read_half);
  let mut subscriptions = Subscriptions::default();
  loop {
    tokio::select! {
      frame = control.next_frame() => match frame? {
        Some(frame) => subscriptions.apply(&frame),
        None => break,
      },
      msg = rx.recv() => match msg {
        Ok(msg) => {
          if capture || subscriptions.matches(&msg) {
            write_frame(&mut write_half, &msg).await?;
          }
        }
        Err(RecvError::Lagged(n)) => {
          tracing::warn!("[BUS] subscriber {} lagged, {} messages dropped", peer, n);
        }
        Err(RecvError::Closed) => break,
      },
    }
  }
  tracing::debug!("[BUS] subscriber {} disconnected", peer);
  Ok(())
}

/// Handle used by proxy workers to publish mirrored traffic.
///
/// Publishing never waits: when the queue towards the broker is full the
/// message is dropped and [`Error::BusSendOverflow`] is returned.
#[derive(Clone, Debug)]
pub struct BusPublisher {
  tx: mpsc::Sender<Bytes>,
}

impl BusPublisher {
  /// Start a publisher that keeps a connection to the broker at `addr`.
  ///
  /// Must be called inside a tokio runtime.
  pub fn connect(addr: impl Into<String>, capacity: usize) -> Self {
    let (publisher, rx) = Self::channel(capacity);
    tokio::spawn(forward_to_broker(addr.into(), rx));
    publisher
  }

  /// A publisher whose messages end up in the returned receiver.
  pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Self { tx }, rx)
  }

  /// Queue `msg` for the broker without waiting.
  pub fn publish(&self, msg: Bytes) -> Result<()> {
    match self.tx.try_send(msg) {
      Ok(()) => Ok(()),
      Err(TrySendError::Full(_)) => {
        tracing::warn!("[BUS] PUB queue overflow, mirror message dropped");
        Err(Error::BusSendOverflow)
      }
      Err(TrySendError::Closed(_)) => Err(new_io_error(
        ErrorKind::BrokenPipe,
        "mirror bus publisher is closed",
      )),
    }
  }
}

async fn forward_to_broker(addr: String, mut rx: mpsc::Receiver<Bytes>) {
  loop {
    let mut stream = match TcpStream::connect(&addr).await {
      Ok(stream) => stream,
      Err(e) => {
        tracing::warn!("[BUS] Failed to connect to broker {}: {}", addr, e);
        tokio::time::sleep(RECONNECT_DELAY).await;
        continue;
      }
    };
    tracing::debug!("[BUS] publisher connected to {}", addr);
    loop {
      let Some(msg) = rx.recv().await else {
        return;
      };
      if let Err(e) = write_frame(&mut stream, &msg).await {
        tracing::warn!("[BUS] Lost broker connection {}: {}", addr, e);
        break;
      }
    }
    tokio::time::sleep(RECONNECT_DELAY).await;
  }
}

/// Filtered subscription to the broker's fan-out listener.
pub struct BusSubscriber {
  reader: FrameReader<OwnedReadHalf>,
  writer: OwnedWriteHalf,
}

impl BusSubscriber {
  /// Connect to the broker's subscribe address.
  pub async fn connect(addr: &str) -> Result<Self> {
    let stream = TcpStream::connect(addr).await?;
    let (read_half, writer) = stream.into_split();
    Ok(Self {
      reader: FrameReader::new(read_half),
      writer,
    })
  }

  /// Start receiving messages whose topic starts with `prefix`
  pub async fn subscribe(&mut self, prefix: &[u8]) -> Result<()> {
    self.control(CONTROL_SUBSCRIBE, prefix).await
  }

  /// Release one subscription to `prefix`
  pub async fn unsubscribe(&mut self, prefix: &[u8]) -> Result<()> {
    self.control(CONTROL_UNSUBSCRIBE, prefix).await
  }

  async fn control(&mut self, op: u8, prefix: &[u8]) -> Result<()> {
    let mut frame = Vec::with_capacity(prefix.len() + 1);
    frame.push(op);
    frame.extend_from_slice(prefix);
    write_frame(&mut self.writer, &frame).await
  }

  /// Next delivered message, `None` once the broker hangs up. Cancel safe.
  pub async fn recv(&mut self) -> Result<Option<Bytes>> {
    self.reader.next_frame().await
  }
}

/// Consumer of the broker's unfiltered capture listener.
pub struct CaptureClient {
  reader: FrameReader<TcpStream>,
}

impl CaptureClient {
  /// Connect to the broker's capture address.
  pub async fn connect(addr: &str) -> Result<Self> {
    let stream = TcpStream::connect(addr).await?;
    Ok(Self {
      reader: FrameReader::new(stream),
    })
  }

  /// Next published message, `None` once the broker hangs up. Cancel safe.
  pub async fn recv(&mut self) -> Result<Option<Bytes>> {
    self.reader.next_frame().await
  }
}
