//! Integration tests for slinger-mirror

use bytes::Bytes;
use slinger_mirror::bus::{Broker, BusPublisher, CaptureClient, FrameReader};
use slinger_mirror::config::{BusConfig, HttpProxyConfig};
use slinger_mirror::counter::{AdmissionCounter, MemoryCounter};
use slinger_mirror::http_proxy::HttpProxy;
use slinger_mirror::socks5::Socks5Server;
use slinger_mirror::topic;
use slinger_mirror::watcher::WatcherServer;
use slinger_mirror::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Echoes everything back until the client hangs up.
async fn echo_server() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let (mut stream, _) = listener.accept().await.unwrap();
      tokio::spawn(async move {
        let (mut r, mut w) = stream.split();
        let _ = tokio::io::copy(&mut r, &mut w).await;
      });
    }
  });
  addr
}

/// Answers one request with a fixed response, reporting the request it saw.
async fn http_origin(response: &'static [u8]) -> (SocketAddr, mpsc::Receiver<Vec<u8>>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let (tx, rx) = mpsc::channel(4);
  tokio::spawn(async move {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
      let n = stream.read(&mut buf).await.unwrap();
      if n == 0 {
        break;
      }
      request.extend_from_slice(&buf[..n]);
    }
    stream.write_all(response).await.unwrap();
    stream.shutdown().await.unwrap();
    tx.send(request).await.unwrap();
  });
  (addr, rx)
}

async fn serve_socks(mirror: BusPublisher) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let server = Socks5Server::new(Some(mirror), Duration::from_secs(5));
  tokio::spawn(async move { server.run(listener).await });
  addr
}

async fn serve_http(proxy: HttpProxy) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move { proxy.run(listener).await });
  addr
}

async fn next_message(rx: &mut mpsc::Receiver<Bytes>) -> Bytes {
  tokio::time::timeout(TIMEOUT, rx.recv())
    .await
    .expect("mirror message")
    .expect("mirror open")
}

async fn request(proxy: SocketAddr, raw: &[u8]) -> String {
  let mut client = TcpStream::connect(proxy).await.unwrap();
  client.write_all(raw).await.unwrap();
  let mut response = Vec::new();
  tokio::time::timeout(TIMEOUT, client.read_to_end(&mut response))
    .await
    .unwrap()
    .unwrap();
  String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn test_socks5_connect_relays_and_mirrors() {
  let upstream = echo_server().await;
  let (mirror, mut mirrored) = BusPublisher::channel(64);
  let proxy = serve_socks(mirror).await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  let client_addr = client.local_addr().unwrap();
  client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
  let mut method = [0u8; 2];
  client.read_exact(&mut method).await.unwrap();
  assert_eq!(method, [0x05, 0x00]);

  let port = upstream.port().to_be_bytes();
  client
    .write_all(&[0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, port[0], port[1]])
    .await
    .unwrap();
  let mut reply = [0u8; 10];
  client.read_exact(&mut reply).await.unwrap();
  assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

  client.write_all(b"ping").await.unwrap();
  let mut echoed = [0u8; 4];
  tokio::time::timeout(TIMEOUT, client.read_exact(&mut echoed))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(&echoed, b"ping");

  let up = next_message(&mut mirrored).await;
  assert_eq!(
    up,
    Bytes::from(format!("{}-{}:\r\nping", client_addr, upstream))
  );
  let down = next_message(&mut mirrored).await;
  assert_eq!(
    down,
    Bytes::from(format!("{}-{}:\r\nping", upstream, client_addr))
  );

  drop(client);
  let mut eofs = vec![
    next_message(&mut mirrored).await,
    next_message(&mut mirrored).await,
  ];
  eofs.sort();
  let mut expected = vec![
    Bytes::from(format!("{}-{}:\r\n", client_addr, upstream)),
    Bytes::from(format!("{}-{}:\r\n", upstream, client_addr)),
  ];
  expected.sort();
  assert_eq!(eofs, expected);
  assert!(eofs.iter().all(|m| topic::is_eof(m)));
}

#[tokio::test]
async fn test_socks5_rejects_ipv6_targets() {
  let (mirror, _mirrored) = BusPublisher::channel(4);
  let proxy = serve_socks(mirror).await;
  let mut client = TcpStream::connect(proxy).await.unwrap();
  // greeting and request in one write, all of it is consumed before the reply
  let mut request = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x04];
  request.extend_from_slice(&[0u8; 15]);
  request.extend_from_slice(&[1, 0x00, 0x50]);
  client.write_all(&request).await.unwrap();
  let mut response = Vec::new();
  tokio::time::timeout(TIMEOUT, client.read_to_end(&mut response))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(&response[..2], &[0x05, 0x00]);
  assert_eq!(&response[2..4], &[0x05, 0x08]);
}

fn http_config(host: &str, auth_ip: bool, loop_detection_ips: Vec<String>) -> HttpProxyConfig {
  HttpProxyConfig {
    host: host.to_string(),
    auth_ip,
    loop_detection_ips,
    ..HttpProxyConfig::default()
  }
}

#[tokio::test]
async fn test_http_proxy_forbids_unwatched_clients() {
  let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let counter = Arc::new(MemoryCounter::default());
  let proxy = HttpProxy::new(
    &http_config("127.0.0.1", true, vec![]),
    Some(counter.clone()),
    None,
    Duration::from_secs(5),
  );
  let proxy = serve_http(proxy).await;

  let response = request(
    proxy,
    b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n",
  )
  .await;
  assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{}", response);

  // a watcher that went away leaves the count at zero
  counter.increment("127.0.0.1").await.unwrap();
  counter.decrement("127.0.0.1").await.unwrap();
  let target = upstream.local_addr().unwrap();
  let raw = format!("GET http://{0}/ HTTP/1.1\r\nHost: {0}\r\n\r\n", target);
  let response = request(proxy, raw.as_bytes()).await;
  assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{}", response);
  assert!(
    tokio::time::timeout(Duration::from_millis(200), upstream.accept())
      .await
      .is_err(),
    "no upstream connection expected"
  );
}

#[tokio::test]
async fn test_http_forward_mirrors_request_and_response() {
  let (origin, mut seen) = http_origin(
    b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
  )
  .await;
  let counter = Arc::new(MemoryCounter::default());
  counter.increment("127.0.0.1").await.unwrap();
  let (mirror, mut mirrored) = BusPublisher::channel(64);
  let proxy = HttpProxy::new(
    &http_config("127.0.0.1", true, vec![]),
    Some(counter),
    Some(mirror),
    Duration::from_secs(5),
  );
  let proxy = serve_http(proxy).await;

  let raw = format!(
    "GET http://{0}/status?x=1 HTTP/1.1\r\nHost: {0}\r\nProxy-Connection: keep-alive\r\n\r\n",
    origin
  );
  let response = request(proxy, raw.as_bytes()).await;
  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
  assert!(response.contains("Connection: close\r\n"), "{}", response);
  assert!(!response.contains("transfer-encoding"), "{}", response);
  assert!(response.ends_with("\r\n\r\nhello"), "{}", response);

  let upstream_request = String::from_utf8(seen.recv().await.unwrap()).unwrap();
  assert!(upstream_request.starts_with("GET /status?x=1 HTTP/1.1\r\n"), "{}", upstream_request);
  assert!(upstream_request.contains("connection: close\r\n"));
  assert!(!upstream_request.contains("proxy-connection"));

  let uplink = next_message(&mut mirrored).await;
  let decoded = topic::decode(&uplink).unwrap();
  assert_eq!(decoded.dst.full(), origin.to_string());
  let body = topic::payload(&uplink).unwrap();
  assert!(body.starts_with(format!("GET http://{}/status?x=1 HTTP/1.1\r\n", origin).as_bytes()));
  assert!(topic::is_eof(&next_message(&mut mirrored).await));

  let head = next_message(&mut mirrored).await;
  assert_eq!(topic::decode(&head).unwrap().src.full(), origin.to_string());
  assert!(topic::payload(&head).unwrap().starts_with(b"HTTP/1.1 200 OK\r\n"));
  assert_eq!(topic::payload(&next_message(&mut mirrored).await), Some(&b"hello"[..]));
  assert!(topic::is_eof(&next_message(&mut mirrored).await));
}

#[tokio::test]
async fn test_http_oversized_request_body_is_refused() {
  let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let target = upstream.local_addr().unwrap();
  let proxy = HttpProxy::new(
    &http_config("127.0.0.1", false, vec![]),
    None,
    None,
    Duration::from_secs(5),
  );
  let proxy = serve_http(proxy).await;

  let raw = format!(
    "POST http://{0}/upload HTTP/1.1\r\nHost: {0}\r\nContent-Length: {1}\r\n\r\n",
    target,
    64 * 1024 * 1024
  );
  let response = request(proxy, raw.as_bytes()).await;
  assert!(response.starts_with("HTTP/1.1 413 "), "{}", response);
  assert!(
    tokio::time::timeout(Duration::from_millis(200), upstream.accept())
      .await
      .is_err(),
    "no upstream connection expected"
  );
}

#[tokio::test]
async fn test_http_connect_to_itself_is_a_loop() {
  let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let target = upstream.local_addr().unwrap();
  let proxy = HttpProxy::new(
    &http_config("proxy.test", false, vec!["127.0.0.1".to_string()]),
    None,
    None,
    Duration::from_secs(5),
  );
  let proxy = serve_http(proxy).await;

  let response = request(proxy, b"CONNECT proxy.test:9997 HTTP/1.1\r\n\r\n").await;
  assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{}", response);

  let raw = format!("CONNECT {} HTTP/1.1\r\n\r\n", target);
  let response = request(proxy, raw.as_bytes()).await;
  assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{}", response);
  assert!(
    tokio::time::timeout(Duration::from_millis(200), upstream.accept())
      .await
      .is_err(),
    "no upstream connection expected"
  );
}

#[tokio::test]
async fn test_http_connect_tunnel_forwards_early_bytes() {
  let upstream = echo_server().await;
  let (mirror, mut mirrored) = BusPublisher::channel(64);
  let proxy = HttpProxy::new(
    &http_config("127.0.0.1", false, vec![]),
    None,
    Some(mirror),
    Duration::from_secs(5),
  );
  let proxy = serve_http(proxy).await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  let raw = format!(
    "CONNECT localhost:{} HTTP/1.1\r\nHost: localhost\r\n\r\nearly",
    upstream.port()
  );
  client.write_all(raw.as_bytes()).await.unwrap();
  let established = b"HTTP/1.1 200 Connection Established\r\n\r\n";
  let mut buf = vec![0u8; established.len() + 5];
  tokio::time::timeout(TIMEOUT, client.read_exact(&mut buf))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(&buf[..established.len()], established);
  assert_eq!(&buf[established.len()..], b"early");

  let up = next_message(&mut mirrored).await;
  assert_eq!(topic::payload(&up), Some(&b"early"[..]));
  assert_eq!(
    topic::decode(&up).unwrap().src.full(),
    client.local_addr().unwrap().to_string()
  );
}

/// Broker on ephemeral ports, returns (publish, subscribe, capture).
async fn start_broker() -> (SocketAddr, SocketAddr, SocketAddr) {
  let broker = Broker::bind(&BusConfig {
    publish_address: "127.0.0.1:0".to_string(),
    subscribe_address: "127.0.0.1:0".to_string(),
    capture_address: Some("127.0.0.1:0".to_string()),
    queue_capacity: 64,
  })
  .await
  .unwrap();
  let addrs = (
    broker.publish_addr().unwrap(),
    broker.subscribe_addr().unwrap(),
    broker.capture_addr().unwrap().unwrap(),
  );
  tokio::spawn(broker.run());
  addrs
}

async fn next_frame(reader: &mut FrameReader<TcpStream>) -> Bytes {
  tokio::time::timeout(TIMEOUT, reader.next_frame())
    .await
    .expect("frame")
    .unwrap()
    .expect("open")
}

#[tokio::test]
async fn test_watcher_trigger_follows_partners() {
  let (publish, subscribe, capture) = start_broker().await;
  let counter = Arc::new(MemoryCounter::default());
  let watcher = WatcherServer::new(subscribe.to_string(), Some(counter.clone()));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let watcher_addr = listener.local_addr().unwrap();
  tokio::spawn(async move { watcher.run(listener).await });

  let mut capture = CaptureClient::connect(&capture.to_string()).await.unwrap();
  let publisher = BusPublisher::connect(publish.to_string(), 64);
  let mut session = TcpStream::connect(watcher_addr).await.unwrap();
  session.write_all(b"trigger 10.0.0.7\n").await.unwrap();
  tokio::time::sleep(Duration::from_millis(300)).await;
  assert_eq!(counter.get("10.0.0.7").await.unwrap(), Some(1));

  let (read_half, write_half) = session.into_split();
  let mut frames = FrameReader::new(read_half);

  publisher
    .publish(Bytes::from_static(b"10.0.0.7:5000-10.0.0.8:80:\r\nGET /"))
    .unwrap();
  assert_eq!(
    tokio::time::timeout(TIMEOUT, frames.next_frame())
      .await
      .unwrap()
      .unwrap()
      .unwrap(),
    Bytes::from_static(b"10.0.0.7:5000-10.0.0.8:80:\r\nGET /")
  );
  tokio::time::sleep(Duration::from_millis(300)).await;
  assert_eq!(counter.get("10.0.0.8").await.unwrap(), Some(1));

  publisher
    .publish(Bytes::from_static(b"10.0.0.9:1-10.0.0.10:2:\r\nunrelated"))
    .unwrap();
  publisher
    .publish(Bytes::from_static(b"10.0.0.8:80-10.0.0.9:1:\r\npartner"))
    .unwrap();
  assert_eq!(
    tokio::time::timeout(TIMEOUT, frames.next_frame())
      .await
      .unwrap()
      .unwrap()
      .unwrap(),
    Bytes::from_static(b"10.0.0.8:80-10.0.0.9:1:\r\npartner")
  );

  // capture sees everything, unfiltered
  let mut captured = Vec::new();
  for _ in 0..3 {
    captured.push(
      tokio::time::timeout(TIMEOUT, capture.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap(),
    );
  }
  assert_eq!(captured[1], Bytes::from_static(b"10.0.0.9:1-10.0.0.10:2:\r\nunrelated"));

  drop(write_half);
  drop(frames);
  tokio::time::sleep(Duration::from_millis(300)).await;
  assert_eq!(counter.get("10.0.0.7").await.unwrap(), Some(0));
  assert_eq!(counter.get("10.0.0.8").await.unwrap(), Some(0));
}

#[tokio::test]
async fn test_watcher_subscribe_and_unsubscribe() {
  let (publish, subscribe, _) = start_broker().await;
  let watcher = WatcherServer::new(subscribe.to_string(), None);
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let watcher_addr = listener.local_addr().unwrap();
  tokio::spawn(async move { watcher.run(listener).await });

  let publisher = BusPublisher::connect(publish.to_string(), 64);
  let mut session = TcpStream::connect(watcher_addr).await.unwrap();
  session
    .write_all(b"subscribe 10.0.0.1 bogus\nsubscribe [2001:db8::1]:443\n")
    .await
    .unwrap();
  tokio::time::sleep(Duration::from_millis(300)).await;

  for msg in [
    &b"10.0.0.2:1-10.0.0.1:2:\r\nnot mine"[..],
    &b"10.0.0.10:2-10.0.0.2:1:\r\nneighbour"[..],
    &b"10.0.0.1:2-10.0.0.2:1:\r\nmine"[..],
    &b"[2001:db8::1]:443-10.0.0.2:1:\r\n"[..],
  ] {
    publisher.publish(Bytes::copy_from_slice(msg)).unwrap();
  }
  let mut frames = FrameReader::new(session);
  assert_eq!(next_frame(&mut frames).await, Bytes::from_static(b"10.0.0.1:2-10.0.0.2:1:\r\nmine"));
  let eof = next_frame(&mut frames).await;
  assert!(topic::is_eof(&eof));
  assert_eq!(topic::decode(&eof).unwrap().src.ip(), "2001:db8::1");
}

/// Refuses every increment, decrements still reach the store.
struct IncrementFails(MemoryCounter);

#[async_trait::async_trait]
impl AdmissionCounter for IncrementFails {
  async fn increment(&self, _ip: &str) -> slinger_mirror::Result<i64> {
    Err(Error::Counter("store unavailable".to_string()))
  }

  async fn decrement(&self, ip: &str) -> slinger_mirror::Result<i64> {
    self.0.decrement(ip).await
  }

  async fn get(&self, ip: &str) -> slinger_mirror::Result<Option<i64>> {
    self.0.get(ip).await
  }
}

#[tokio::test]
async fn test_watcher_never_decrements_a_failed_increment() {
  let (_, subscribe, _) = start_broker().await;
  let counter = Arc::new(IncrementFails(MemoryCounter::default()));
  let watcher = WatcherServer::new(subscribe.to_string(), Some(counter.clone()));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let watcher_addr = listener.local_addr().unwrap();
  tokio::spawn(async move { watcher.run(listener).await });

  let mut session = TcpStream::connect(watcher_addr).await.unwrap();
  session
    .write_all(b"subscribe 10.0.0.1 10.0.0.1:80\nunsubscribe 10.0.0.1\n")
    .await
    .unwrap();
  tokio::time::sleep(Duration::from_millis(300)).await;
  drop(session);
  tokio::time::sleep(Duration::from_millis(300)).await;
  assert_eq!(counter.get("10.0.0.1").await.unwrap(), None);
}

#[cfg(unix)]
#[tokio::test]
async fn test_supervisor_replaces_crashed_worker() {
  use slinger_mirror::supervisor::{Supervisor, WorkerEvent, WorkerSpec};

  let poll_interval = Duration::from_millis(50);
  let mut supervisor = Supervisor::new(poll_interval);
  supervisor
    .spawn(WorkerSpec::new("crashy", "/bin/sh", ["-c", "exit 1"]), 1)
    .unwrap();
  let before = supervisor.pids();
  tokio::time::sleep(Duration::from_millis(200)).await;
  let events = supervisor.poll();
  assert!(matches!(
    events.as_slice(),
    [WorkerEvent::Restarted { name, .. }] if name == "crashy"
  ));
  assert_eq!(supervisor.len(), 1);
  assert_ne!(supervisor.pids(), before);
}
