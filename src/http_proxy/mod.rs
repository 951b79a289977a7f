//! HTTP forward proxy
//!
//! One request per connection. `CONNECT` turns the connection into a relay
//! [`Pipe`]; any other method is forwarded to the origin server and both the
//! request and the response are mirrored on the bus.
pub mod message;

use crate::bus::BusPublisher;
use crate::config::HttpProxyConfig;
use crate::counter::AdmissionCounter;
use crate::errors::{Error, Result};
use crate::pipe::{Endpoint, Pipe, Role};
use crate::topic::{Direction, Topic};
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, HOST};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, Version};
use message::{BodyKind, BodyReader, RequestHead};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Parse a `CONNECT` target: hostname characters, `:`, digits.
///
/// Anything after the port digits is ignored.
pub fn parse_connect_target(target: &str) -> Result<(String, u16)> {
  let host_len = target
    .bytes()
    .take_while(|b| b.is_ascii_alphanumeric() || *b == b'-' || *b == b'.')
    .count();
  let invalid = || Error::bad_request(format!("invalid CONNECT target: {}", target));
  if host_len == 0 {
    return Err(invalid());
  }
  let rest = target[host_len..].strip_prefix(':').ok_or_else(invalid)?;
  let digits = &rest[..rest.bytes().take_while(u8::is_ascii_digit).count()];
  let port = digits.parse::<u16>().map_err(|_| invalid())?;
  Ok((target[..host_len].to_string(), port))
}

/// Whether `target` starts with a URL scheme (`[A-Za-z][A-Za-z0-9]*:`).
fn has_scheme(target: &str) -> bool {
  let mut bytes = target.bytes();
  if !bytes.next().is_some_and(|b| b.is_ascii_alphabetic()) {
    return false;
  }
  bytes
    .find(|b| !b.is_ascii_alphanumeric())
    .is_some_and(|b| b == b':')
}

/// Absolute URL of a forwarded request.
///
/// Targets without a scheme are completed from the `Host` header; only `http`
/// URLs can be forwarded.
pub fn build_url(target: &str, headers: &HeaderMap) -> Result<Uri> {
  let url = if has_scheme(target) {
    target.to_string()
  } else {
    let host = headers
      .get(HOST)
      .and_then(|h| h.to_str().ok())
      .map(|h| h.trim().to_ascii_lowercase())
      .unwrap_or_default();
    if host.is_empty() {
      return Err(Error::bad_request("request without Host header"));
    }
    if target.starts_with('/') {
      format!("http://{}{}", host, target)
    } else {
      format!("http://{}/{}", host, target)
    }
  };
  let uri: Uri = url
    .parse()
    .map_err(|_| Error::bad_request(format!("invalid URL: {}", url)))?;
  if !uri
    .scheme_str()
    .is_some_and(|s| s.eq_ignore_ascii_case("http"))
  {
    return Err(Error::bad_request(format!("unsupported scheme in {}", url)));
  }
  if uri.host().is_none() {
    return Err(Error::bad_request(format!("URL without host: {}", url)));
  }
  Ok(uri)
}

/// HTTP proxy service
#[derive(Clone)]
pub struct HttpProxy {
  listen_host: String,
  auth_ip: bool,
  loop_detection_ips: Arc<Vec<String>>,
  counter: Option<Arc<dyn AdmissionCounter>>,
  mirror: Option<BusPublisher>,
  connect_timeout: Duration,
}

impl std::fmt::Debug for HttpProxy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HttpProxy")
      .field("listen_host", &self.listen_host)
      .field("auth_ip", &self.auth_ip)
      .field("loop_detection_ips", &self.loop_detection_ips)
      .finish()
  }
}

impl HttpProxy {
  /// Create the service.
  ///
  /// `counter` is consulted only when `auth_ip` is on.
  pub fn new(
    config: &HttpProxyConfig,
    counter: Option<Arc<dyn AdmissionCounter>>,
    mirror: Option<BusPublisher>,
    connect_timeout: Duration,
  ) -> Self {
    HttpProxy {
      listen_host: config.host.trim().to_ascii_lowercase(),
      auth_ip: config.auth_ip,
      loop_detection_ips: Arc::new(
        config
          .loop_detection_ips
          .iter()
          .map(|ip| ip.trim().to_ascii_lowercase())
          .collect(),
      ),
      counter,
      mirror,
      connect_timeout,
    }
  }

  /// Accept connections forever
  pub async fn run(&self, listener: TcpListener) -> Result<()> {
    loop {
      match listener.accept().await {
        Ok((stream, peer_addr)) => {
          let proxy = self.clone();
          tokio::spawn(async move {
            if let Err(e) = proxy.handle_connection(stream, peer_addr).await {
              tracing::debug!("[HTTP] {} closed: {}", peer_addr, e);
            }
          });
        }
        Err(e) => {
          tracing::error!("[HTTP] Failed to accept connection: {}", e);
        }
      }
    }
  }

  /// Serve the single request of one client connection.
  pub async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let head = match message::read_request_head(&mut reader).await {
      Ok(Some(head)) => head,
      Ok(None) => return Ok(()),
      Err(e) => return fail(&mut writer, Version::HTTP_11, e).await,
    };
    tracing::debug!("[HTTP] {} {} {}", peer_addr, head.method, head.target);

    if let Err(e) = self.admit(&peer_addr).await {
      return fail(&mut writer, head.version, e).await;
    }

    if head.method == Method::CONNECT {
      let (host, port) = match parse_connect_target(&head.target) {
        Ok(target) => target,
        Err(e) => return fail(&mut writer, head.version, e).await,
      };
      if self.is_loop(&host, port).await {
        let e = Error::LoopDetected { host, port };
        return fail(&mut writer, head.version, e).await;
      }
      self.connect(host, port, peer_addr, reader, writer).await
    } else {
      self.forward(head, peer_addr, reader, writer).await
    }
  }

  async fn admit(&self, peer_addr: &SocketAddr) -> Result<()> {
    if !self.auth_ip {
      return Ok(());
    }
    let Some(counter) = &self.counter else {
      return Ok(());
    };
    let ip = peer_addr.ip().to_canonical().to_string();
    match counter.get(&ip).await {
      Ok(Some(count)) if count > 0 => Ok(()),
      Ok(_) => Err(Error::Forbidden(ip)),
      Err(e) => {
        tracing::warn!("[HTTP] admission check for {} failed: {}", ip, e);
        Err(Error::Forbidden(ip))
      }
    }
  }

  /// The target is this proxy itself.
  pub async fn is_loop(&self, host: &str, port: u16) -> bool {
    let host = host.trim().to_ascii_lowercase();
    if host.starts_with("127.") || host == self.listen_host {
      return true;
    }
    let found = match tokio::net::lookup_host((host.as_str(), port)).await {
      Ok(addrs) => addrs
        .map(|addr| addr.ip().to_string())
        .any(|ip| self.loop_detection_ips.iter().any(|local| *local == ip)),
      Err(e) => {
        tracing::debug!("[HTTP] resolving {} failed: {}", host, e);
        false
      }
    };
    found
  }

  async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
    let target = format!("{}:{}", host, port);
    match tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port))).await {
      Ok(Ok(stream)) => Ok(stream),
      Ok(Err(e)) => Err(Error::upstream_connect(target, e)),
      Err(_) => Err(Error::upstream_connect(
        target,
        std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
      )),
    }
  }

  async fn connect(
    &self,
    host: String,
    port: u16,
    peer_addr: SocketAddr,
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
  ) -> Result<()> {
    let upstream = match self.dial(&host, port).await {
      Ok(upstream) => upstream,
      Err(e) => return fail(&mut writer, Version::HTTP_11, e).await,
    };
    let upstream_addr = upstream.peer_addr()?;
    let (upstream_reader, upstream_writer) = upstream.into_split();
    let upstream_ep = Endpoint::new(upstream_addr, Role::Upstream, upstream_writer);
    let client_ep = Endpoint::new(peer_addr, Role::Client, writer);
    let pipe = Pipe::attach(upstream_ep, client_ep.clone(), self.mirror.clone())?;
    if let Err(e) = client_ep.write_raw(CONNECT_ESTABLISHED).await {
      pipe.close().await;
      return Err(e);
    }
    tracing::debug!("[HTTP] {} tunnel to {}:{}", peer_addr, host, port);
    // bytes already buffered behind the request head are read out first
    pipe.run(upstream_reader, reader).await;
    Ok(())
  }

  async fn forward(
    &self,
    head: RequestHead,
    peer_addr: SocketAddr,
    mut reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
  ) -> Result<()> {
    let url = match build_url(&head.target, &head.headers) {
      Ok(url) => url,
      Err(e) => return fail(&mut writer, head.version, e).await,
    };
    let body = match BodyKind::of_request(&head.headers) {
      Ok(kind) => match message::read_body(&mut reader, kind, message::MAX_BODY_SIZE).await {
        Ok(body) => body,
        Err(e) => return fail(&mut writer, head.version, e).await,
      },
      Err(e) => return fail(&mut writer, head.version, e).await,
    };
    let host = url
      .host()
      .unwrap_or_default()
      .trim_start_matches('[')
      .trim_end_matches(']')
      .to_string();
    let port = url.port_u16().unwrap_or(80);
    let upstream = match self.dial(&host, port).await {
      Ok(upstream) => upstream,
      Err(e) => return fail(&mut writer, head.version, e).await,
    };
    let upstream_addr = upstream.peer_addr()?;
    let mut upstream = BufReader::new(upstream);

    upstream
      .get_mut()
      .write_all(&upstream_request(&head, &url, &body)?)
      .await?;

    let uplink = Topic::encode(Direction::Uplink, &peer_addr, &upstream_addr);
    let mut mirrored = format!(
      "{} {} {}\r\n",
      head.method,
      head.target,
      message::version_str(head.version)
    )
    .into_bytes();
    message::write_headers(&mut mirrored, &message::restore_headers(&head.headers));
    mirrored.extend_from_slice(b"\r\n");
    mirrored.extend_from_slice(&body);
    self.publish(uplink.wrap(&mirrored));
    self.publish(uplink.eof());

    let response = loop {
      let response = match message::read_response_head(&mut upstream).await {
        Ok(response) => response,
        Err(e) => {
          let bad_gateway = message::error_response(head.version, StatusCode::BAD_GATEWAY);
          let _ = writer.write_all(&bad_gateway).await;
          let _ = writer.shutdown().await;
          self.publish(Topic::encode(Direction::Downlink, &peer_addr, &upstream_addr).eof());
          return Err(e);
        }
      };
      // interim responses are not relayed
      if !response.status.is_informational() || response.status == StatusCode::SWITCHING_PROTOCOLS {
        break response;
      }
    };
    let kind = BodyKind::of_response(&head.method, response.status, &response.headers)?;

    let mut headers = message::restore_headers(&response.headers);
    if !message::is_identity(&response.headers) {
      if let Some(encoding) = response.headers.get(CONTENT_ENCODING) {
        headers.insert(CONTENT_ENCODING, encoding.clone());
      }
    }
    let response_head = message::response_head_bytes(head.version, response.status, &headers);
    let mut client_head = response_head.clone();
    client_head.extend_from_slice(b"Connection: close\r\n\r\n");
    writer.write_all(&client_head).await?;

    let downlink = Topic::encode(Direction::Downlink, &peer_addr, &upstream_addr);
    let mut mirrored_head = response_head;
    mirrored_head.extend_from_slice(b"\r\n");
    self.publish(downlink.wrap(&mirrored_head));

    let mut decoder = BodyReader::new(kind);
    let relayed = async {
      while let Some(chunk) = decoder.next_chunk(&mut upstream).await? {
        writer.write_all(&chunk).await?;
        self.publish(downlink.wrap(&chunk));
      }
      Ok::<(), Error>(())
    }
    .await;
    self.publish(downlink.eof());
    let _ = writer.shutdown().await;
    relayed
  }

  fn publish(&self, msg: Bytes) {
    if let Some(mirror) = &self.mirror {
      if let Err(e) = mirror.publish(msg) {
        tracing::debug!("[HTTP] mirror dropped: {}", e);
      }
    }
  }
}

/// Request bytes sent to the origin server.
fn upstream_request(head: &RequestHead, url: &Uri, body: &[u8]) -> Result<Vec<u8>> {
  let path = url.path_and_query().map(|p| p.as_str()).unwrap_or("/");
  let path = if path.is_empty() { "/" } else { path };
  let mut headers = message::cleanup_headers(&head.headers);
  if !headers.contains_key(HOST) {
    let authority = url
      .authority()
      .map(|a| a.as_str())
      .ok_or_else(|| Error::bad_request("URL without host"))?;
    headers.insert(HOST, HeaderValue::from_str(authority)?);
  }
  if !body.is_empty() || head.headers.contains_key(CONTENT_LENGTH) {
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
  }
  headers.insert(CONNECTION, HeaderValue::from_static("close"));
  let mut buf = format!("{} {} HTTP/1.1\r\n", head.method, path).into_bytes();
  message::write_headers(&mut buf, &headers);
  buf.extend_from_slice(b"\r\n");
  buf.extend_from_slice(body);
  Ok(buf)
}

/// Answer with the status `error` maps to, then close.
async fn fail<W>(writer: &mut W, version: Version, error: Error) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let status = error.status_code().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
  writer
    .write_all(&message::error_response(version, status))
    .await?;
  let _ = writer.shutdown().await;
  Err(error)
}
