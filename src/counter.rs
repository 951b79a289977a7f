//! Admission counter store
//!
//! Watcher sessions increment the counter of every client IP they watch and
//! decrement it when they stop; the HTTP proxy serves an IP only while its
//! counter is positive.
use crate::config::{CounterBackend, CounterConfig};
use crate::errors::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Refcount per client IP shared by watchers and proxies.
#[async_trait]
pub trait AdmissionCounter: Send + Sync {
  /// Add one watcher interest, returns the new count
  async fn increment(&self, ip: &str) -> Result<i64>;
  /// Remove one watcher interest, returns the new count
  async fn decrement(&self, ip: &str) -> Result<i64>;
  /// Current count, `None` when the IP was never counted
  async fn get(&self, ip: &str) -> Result<Option<i64>>;
}

/// Build the store selected by `config`
pub fn from_config(config: &CounterConfig) -> Arc<dyn AdmissionCounter> {
  match config.backend {
    CounterBackend::Redis => Arc::new(RedisCounter::new(&config.address, config.pool_size)),
    CounterBackend::Memory => Arc::new(MemoryCounter::default()),
  }
}

/// In-process counter
#[derive(Debug, Default)]
pub struct MemoryCounter {
  counts: Mutex<HashMap<String, i64>>,
}

#[async_trait]
impl AdmissionCounter for MemoryCounter {
  async fn increment(&self, ip: &str) -> Result<i64> {
    let mut counts = self.counts.lock().await;
    let count = counts.entry(ip.to_string()).or_insert(0);
    *count += 1;
    Ok(*count)
  }

  async fn decrement(&self, ip: &str) -> Result<i64> {
    let mut counts = self.counts.lock().await;
    let count = counts.entry(ip.to_string()).or_insert(0);
    *count -= 1;
    Ok(*count)
  }

  async fn get(&self, ip: &str) -> Result<Option<i64>> {
    Ok(self.counts.lock().await.get(ip).copied())
  }
}

type Connection = BufReader<TcpStream>;

/// Counter kept in redis, `INCR`/`DECR`/`GET` on the IP as key.
///
/// Connections are opened on first use and dropped after any I/O error, so
/// the next command on that slot reconnects.
pub struct RedisCounter {
  address: String,
  pool: Vec<Mutex<Option<Connection>>>,
  next: AtomicUsize,
}

impl std::fmt::Debug for RedisCounter {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RedisCounter")
      .field("address", &self.address)
      .field("pool_size", &self.pool.len())
      .finish()
  }
}

impl RedisCounter {
  /// Store at `address` with up to `pool_size` connections
  pub fn new(address: &str, pool_size: usize) -> Self {
    RedisCounter {
      address: address.to_string(),
      pool: (0..pool_size.max(1)).map(|_| Mutex::new(None)).collect(),
      next: AtomicUsize::new(0),
    }
  }

  async fn command(&self, args: &[&[u8]]) -> Result<Reply> {
    let slot = &self.pool[self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len()];
    let mut slot = slot.lock().await;
    let mut conn = match slot.take() {
      Some(conn) => conn,
      None => {
        let stream = TcpStream::connect(&self.address)
          .await
          .map_err(|e| Error::counter_error(format!("connect {}: {}", self.address, e)))?;
        BufReader::new(stream)
      }
    };
    let result = exchange(&mut conn, args).await;
    match &result {
      Err(Error::IO(_) | Error::Protocol(_)) => {
        tracing::debug!("[COUNTER] dropping connection to {}", self.address);
      }
      _ => *slot = Some(conn),
    }
    result
  }

  async fn integer(&self, args: &[&[u8]]) -> Result<i64> {
    match self.command(args).await? {
      Reply::Integer(n) => Ok(n),
      other => Err(Error::counter_error(format!(
        "unexpected reply {:?}",
        other
      ))),
    }
  }
}

#[async_trait]
impl AdmissionCounter for RedisCounter {
  async fn increment(&self, ip: &str) -> Result<i64> {
    self.integer(&[b"INCR".as_slice(), ip.as_bytes()]).await
  }

  async fn decrement(&self, ip: &str) -> Result<i64> {
    self.integer(&[b"DECR".as_slice(), ip.as_bytes()]).await
  }

  async fn get(&self, ip: &str) -> Result<Option<i64>> {
    match self.command(&[b"GET".as_slice(), ip.as_bytes()]).await? {
      Reply::Bulk(None) => Ok(None),
      Reply::Bulk(Some(value)) => std::str::from_utf8(&value)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .map(Some)
        .ok_or_else(|| Error::counter_error(format!("counter for {} is not a number", ip))),
      Reply::Integer(n) => Ok(Some(n)),
      other => Err(Error::counter_error(format!(
        "unexpected reply {:?}",
        other
      ))),
    }
  }
}

/// RESP reply kinds the counter understands
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reply {
  Simple(String),
  Integer(i64),
  Bulk(Option<Vec<u8>>),
}

fn encode_command(args: &[&[u8]]) -> Vec<u8> {
  let mut out = format!("*{}\r\n", args.len()).into_bytes();
  for arg in args {
    out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
    out.extend_from_slice(arg);
    out.extend_from_slice(b"\r\n");
  }
  out
}

async fn exchange(conn: &mut Connection, args: &[&[u8]]) -> Result<Reply> {
  conn.get_mut().write_all(&encode_command(args)).await?;
  read_reply(conn).await
}

async fn read_reply<R>(reader: &mut R) -> Result<Reply>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = String::new();
  if reader.read_line(&mut line).await? == 0 {
    return Err(Error::protocol_error("redis closed the connection"));
  }
  let line = line.trim_end_matches(['\r', '\n']);
  let mut chars = line.chars();
  let kind = chars.next();
  let rest = chars.as_str();
  match kind {
    Some('+') => Ok(Reply::Simple(rest.to_string())),
    Some('-') => Err(Error::counter_error(rest.to_string())),
    Some(':') => rest
      .parse()
      .map(Reply::Integer)
      .map_err(|_| Error::protocol_error(format!("bad integer reply: {}", line))),
    Some('$') => {
      let len: i64 = rest
        .parse()
        .map_err(|_| Error::protocol_error(format!("bad bulk reply: {}", line)))?;
      if len < 0 {
        return Ok(Reply::Bulk(None));
      }
      let mut value = vec![0u8; len as usize + 2];
      reader.read_exact(&mut value).await?;
      value.truncate(len as usize);
      Ok(Reply::Bulk(Some(value)))
    }
    _ => Err(Error::protocol_error(format!(
      "unsupported redis reply: {}",
      line
    ))),
  }
}
