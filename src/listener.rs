//! Listening sockets shared between the supervisor and its workers
//!
//! The supervisor binds every listener once and hands the descriptor numbers
//! of a service to its workers in [`LISTEN_FDS_ENV`]. The descriptors stay
//! close-on-exec in the supervisor; [`set_inheritable`] clears the flag in a
//! worker between fork and exec, so each worker inherits only the listeners of
//! its own service. Workers adopt the inherited descriptors and accept on them
//! concurrently.
use crate::config::ANY_HOST;
use crate::errors::{Error, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

/// Environment variable carrying the inherited listener descriptors.
pub const LISTEN_FDS_ENV: &str = "SLINGER_MIRROR_LISTEN_FDS";

/// Addresses a `host` setting binds to; `*` is every IPv4 and IPv6 interface.
pub fn resolve_listen_addrs(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
  if host == ANY_HOST || host.is_empty() {
    return Ok(vec![
      SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
      SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
    ]);
  }
  if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
    return Ok(vec![SocketAddr::new(ip, port)]);
  }
  let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
  if addrs.is_empty() {
    return Err(Error::Config(format!("{} resolves to no address", host)));
  }
  Ok(addrs)
}

/// Bind and listen on every address of `host:port`.
///
/// Addresses whose family is unavailable on this machine are skipped; it is an
/// error only when nothing could be bound.
pub fn create_listen_sockets(host: &str, port: u16, backlog: u32) -> Result<Vec<std::net::TcpListener>> {
  let mut listeners = Vec::new();
  let mut last_error = None;
  for addr in resolve_listen_addrs(host, port)? {
    match bind_one(addr, backlog) {
      Ok(listener) => {
        tracing::debug!("[LISTEN] bound {}", addr);
        listeners.push(listener);
      }
      Err(e) => {
        tracing::debug!("[LISTEN] skipping {}: {}", addr, e);
        last_error = Some(e);
      }
    }
  }
  match (listeners.is_empty(), last_error) {
    (true, Some(e)) => Err(e.into()),
    (true, None) => Err(Error::Config(format!("nothing to bind for {}:{}", host, port))),
    _ => Ok(listeners),
  }
}

fn bind_one(addr: SocketAddr, backlog: u32) -> std::io::Result<std::net::TcpListener> {
  let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
  socket.set_reuse_address(true)?;
  if addr.is_ipv6() {
    socket.set_only_v6(true)?;
  }
  socket.bind(&addr.into())?;
  socket.listen(backlog.min(i32::MAX as u32) as i32)?;
  Ok(socket.into())
}

/// Descriptor numbers of `listeners`
#[cfg(unix)]
pub fn listen_fds(listeners: &[std::net::TcpListener]) -> Result<Vec<i32>> {
  use std::os::unix::io::AsRawFd;
  Ok(listeners.iter().map(AsRawFd::as_raw_fd).collect())
}

/// Descriptor numbers of `listeners`
#[cfg(not(unix))]
pub fn listen_fds(_listeners: &[std::net::TcpListener]) -> Result<Vec<i32>> {
  Err(Error::Config("listener inheritance needs a unix platform".to_string()))
}

/// Value of [`LISTEN_FDS_ENV`] for `fds`
pub fn render_fds(fds: &[i32]) -> String {
  fds
    .iter()
    .map(|fd| fd.to_string())
    .collect::<Vec<_>>()
    .join(",")
}

/// Clear close-on-exec on an open socket descriptor.
///
/// Only calls `fcntl`, so it may run between fork and exec.
#[cfg(unix)]
pub fn set_inheritable(fd: i32) -> std::io::Result<()> {
  use std::os::fd::BorrowedFd;
  // SAFETY: the caller names a descriptor that stays open for this call.
  let fd = unsafe { BorrowedFd::borrow_raw(fd) };
  socket2::SockRef::from(&fd).set_cloexec(false)
}

/// Adopt the listeners named by [`LISTEN_FDS_ENV`]. Needs a tokio runtime.
#[cfg(unix)]
pub fn inherited_listeners() -> Result<Vec<tokio::net::TcpListener>> {
  use std::os::unix::io::{FromRawFd, RawFd};
  let value = std::env::var(LISTEN_FDS_ENV)
    .map_err(|_| Error::Config(format!("{} is not set", LISTEN_FDS_ENV)))?;
  let mut listeners = Vec::new();
  for token in value.split(',').filter(|t| !t.is_empty()) {
    let fd: RawFd = token
      .trim()
      .parse()
      .map_err(|_| Error::Config(format!("bad descriptor in {}: {:?}", LISTEN_FDS_ENV, token)))?;
    // SAFETY: the supervisor created this descriptor as a listening socket and
    // this process takes sole ownership of its copy.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener.set_nonblocking(true)?;
    listeners.push(tokio::net::TcpListener::from_std(std_listener)?);
  }
  if listeners.is_empty() {
    return Err(Error::Config(format!("{} names no descriptor", LISTEN_FDS_ENV)));
  }
  Ok(listeners)
}

/// Adopt the listeners named by [`LISTEN_FDS_ENV`]. Needs a tokio runtime.
#[cfg(not(unix))]
pub fn inherited_listeners() -> Result<Vec<tokio::net::TcpListener>> {
  Err(Error::Config("listener inheritance needs a unix platform".to_string()))
}
