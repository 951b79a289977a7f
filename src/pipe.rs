//! Bidirectional relay between two connections
//!
//! An [`Endpoint`] is the writable side of one connection. A [`Pipe`] owns two
//! endpoints, copies bytes read from one into the other and publishes a copy of
//! each chunk on the mirror bus, under the topic of the direction it travelled.
//! When either side goes away the pipe closes both and publishes one EOF per
//! endpoint.
use crate::bus::BusPublisher;
use crate::errors::{new_io_error, Error, Result};
use crate::topic::{Direction, Topic};
use std::fmt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

const READ_BUFFER_SIZE: usize = 8192;

/// Type-erased write half of a connection
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Which side of the proxy an endpoint faces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
  /// the proxied client
  Client,
  /// the connection the proxy dialed
  Upstream,
}

/// Writable side of a relayed connection.
pub struct Endpoint {
  peer: SocketAddr,
  role: Role,
  writer: Mutex<Option<BoxedWriter>>,
  claimed: AtomicBool,
  owner: OnceLock<Weak<Pipe>>,
  closed: AtomicBool,
  uplink: OnceLock<Topic>,
  downlink: OnceLock<Topic>,
}

impl fmt::Debug for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Endpoint")
      .field("peer", &self.peer)
      .field("role", &self.role)
      .field("closed", &self.is_closed())
      .finish()
  }
}

impl Endpoint {
  /// Wrap the write half of a connection to `peer`.
  pub fn new<W>(peer: SocketAddr, role: Role, writer: W) -> Arc<Self>
  where
    W: AsyncWrite + Send + Unpin + 'static,
  {
    Arc::new(Endpoint {
      peer,
      role,
      writer: Mutex::new(Some(Box::new(writer))),
      claimed: AtomicBool::new(false),
      owner: OnceLock::new(),
      closed: AtomicBool::new(false),
      uplink: OnceLock::new(),
      downlink: OnceLock::new(),
    })
  }

  /// Remote address of the connection
  pub fn peer_addr(&self) -> SocketAddr {
    self.peer
  }

  /// Side of the proxy
  pub fn role(&self) -> Role {
    self.role
  }

  /// The pipe this endpoint belongs to, if any
  pub fn pipe(&self) -> Option<Arc<Pipe>> {
    self.owner.get().and_then(Weak::upgrade)
  }

  /// Whether the endpoint has been closed
  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  /// Topic for traffic in `direction` between this endpoint and `partner`.
  ///
  /// Computed once; the partner of an endpoint never changes.
  pub fn topic(&self, direction: Direction, partner: &SocketAddr) -> &Topic {
    let cell = match direction {
      Direction::Uplink => &self.uplink,
      Direction::Downlink => &self.downlink,
    };
    cell.get_or_init(|| Topic::encode(direction, &self.peer, partner))
  }

  /// Write bytes straight to the connection, bypassing the mirror.
  pub async fn write_raw(&self, data: &[u8]) -> Result<()> {
    let mut writer = self.writer.lock().await;
    match writer.as_mut() {
      Some(w) => {
        w.write_all(data).await?;
        w.flush().await?;
        Ok(())
      }
      None => Err(new_io_error(ErrorKind::NotConnected, "endpoint is closed")),
    }
  }

  async fn shutdown(&self) {
    let writer = self.writer.lock().await.take();
    if let Some(mut w) = writer {
      if let Err(e) = w.shutdown().await {
        tracing::trace!("[PIPE] shutdown {}: {}", self.peer, e);
      }
    }
  }
}

/// Two endpoints relaying to each other.
pub struct Pipe {
  endpoints: [Arc<Endpoint>; 2],
  mirror: Option<BusPublisher>,
  closed: AtomicBool,
}

impl fmt::Debug for Pipe {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Pipe")
      .field("endpoints", &self.endpoints)
      .field("mirror", &self.mirror.is_some())
      .finish()
  }
}

impl Pipe {
  /// Join `first` and `second`.
  ///
  /// Fails with [`Error::AlreadyPiped`] when either endpoint already belongs
  /// to a pipe; neither endpoint is claimed in that case.
  pub fn attach(
    first: Arc<Endpoint>,
    second: Arc<Endpoint>,
    mirror: Option<BusPublisher>,
  ) -> Result<Arc<Pipe>> {
    if Arc::ptr_eq(&first, &second) || first.claimed.swap(true, Ordering::AcqRel) {
      return Err(Error::AlreadyPiped);
    }
    if second.claimed.swap(true, Ordering::AcqRel) {
      first.claimed.store(false, Ordering::Release);
      return Err(Error::AlreadyPiped);
    }
    let pipe = Arc::new_cyclic(|weak: &Weak<Pipe>| {
      // claimed above, so these are the first and only owners
      let _ = first.owner.set(weak.clone());
      let _ = second.owner.set(weak.clone());
      Pipe {
        endpoints: [first, second],
        mirror,
        closed: AtomicBool::new(false),
      }
    });
    tracing::debug!(
      "[PIPE] {} <-> {}",
      pipe.endpoints[0].peer,
      pipe.endpoints[1].peer
    );
    Ok(pipe)
  }

  /// The two endpoints in attach order
  pub fn endpoints(&self) -> &[Arc<Endpoint>; 2] {
    &self.endpoints
  }

  /// The endpoint opposite `ep`
  pub fn partner(&self, ep: &Endpoint) -> Option<&Arc<Endpoint>> {
    let [first, second] = &self.endpoints;
    if std::ptr::eq(Arc::as_ptr(first), ep) {
      Some(second)
    } else if std::ptr::eq(Arc::as_ptr(second), ep) {
      Some(first)
    } else {
      None
    }
  }

  /// Whether [`Pipe::close`] has run
  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  /// Relay `data` received on `from` to its partner and mirror it.
  pub async fn forward(&self, from: &Endpoint, data: &[u8]) -> Result<()> {
    let partner = self
      .partner(from)
      .ok_or_else(|| new_io_error(ErrorKind::NotFound, "endpoint is not part of this pipe"))?;
    partner.write_raw(data).await?;
    self.mirror(from, partner, data);
    Ok(())
  }

  fn mirror(&self, from: &Endpoint, partner: &Endpoint, data: &[u8]) {
    let Some(publisher) = &self.mirror else {
      return;
    };
    let topic = from.topic(Direction::Uplink, &partner.peer);
    if let Err(e) = publisher.publish(topic.wrap(data)) {
      tracing::debug!("[PIPE] mirror {} dropped: {}", topic, e);
    }
  }

  /// Close both endpoints. Each endpoint's EOF is published exactly once.
  pub async fn close(&self) {
    if self.closed.swap(true, Ordering::AcqRel) {
      return;
    }
    let [first, second] = &self.endpoints;
    for (ep, partner) in [(first, second), (second, first)] {
      if ep.closed.swap(true, Ordering::AcqRel) {
        continue;
      }
      ep.shutdown().await;
      self.mirror(ep, partner, &[]);
    }
    tracing::debug!("[PIPE] closed {} <-> {}", first.peer, second.peer);
  }

  /// Copy everything read from `reader` into the partner of `from`.
  pub async fn pump<R>(&self, from: &Endpoint, mut reader: R) -> Result<()>
  where
    R: AsyncRead + Unpin,
  {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
      let n = reader.read(&mut buf).await?;
      if n == 0 {
        return Ok(());
      }
      self.forward(from, &buf[..n]).await?;
    }
  }

  /// Relay until either side ends, then close the pipe.
  ///
  /// `first` and `second` are the read halves of the endpoints in attach order.
  pub async fn run<R1, R2>(&self, first: R1, second: R2)
  where
    R1: AsyncRead + Unpin,
    R2: AsyncRead + Unpin,
  {
    let [a, b] = &self.endpoints;
    let result = tokio::select! {
      r = self.pump(a, first) => r,
      r = self.pump(b, second) => r,
    };
    if let Err(e) = result {
      tracing::debug!("[PIPE] relay {} <-> {} ended: {}", a.peer, b.peer, e);
    }
    self.close().await;
  }
}
