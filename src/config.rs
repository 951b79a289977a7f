//! Configuration file
//!
//! Every section is optional. Omitted keys fall back to the defaults below,
//! so an empty file is a valid configuration.
//!
//! ```toml
//! [log]
//! level = "debug"
//!
//! [socks]
//! enabled = true
//! port = 1080
//!
//! [http_proxy]
//! auth_ip = true
//! loop_detection_ips = ["127.0.0.1", "10.0.0.5"]
//!
//! [counter]
//! backend = "redis"
//! address = "127.0.0.1:6379"
//! ```
use crate::errors::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Host value meaning every local address, IPv4 and IPv6
pub const ANY_HOST: &str = "*";

fn cpu_count() -> usize {
  std::thread::available_parallelism()
    .map(|n| n.get())
    .unwrap_or(1)
}

/// Top level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// logging
  pub log: LogConfig,
  /// SOCKS5 relay service
  pub socks: SocksConfig,
  /// HTTP forward proxy service
  pub http_proxy: HttpProxyConfig,
  /// watcher service
  pub watcher: WatcherConfig,
  /// admission counter store
  pub counter: CounterConfig,
  /// mirror bus broker
  pub bus: BusConfig,
  /// worker supervision
  pub supervisor: SupervisorConfig,
  /// Seconds allowed for an upstream connect
  pub connect_timeout_secs: u64,
}

impl Default for Config {
  fn default() -> Self {
    Config {
      log: LogConfig::default(),
      socks: SocksConfig::default(),
      http_proxy: HttpProxyConfig::default(),
      watcher: WatcherConfig::default(),
      counter: CounterConfig::default(),
      bus: BusConfig::default(),
      supervisor: SupervisorConfig::default(),
      connect_timeout_secs: 30,
    }
  }
}

impl Config {
  /// Load from `path`, or defaults when no path is given.
  pub fn load(path: Option<&Path>) -> Result<Self> {
    let Some(path) = path else {
      tracing::warn!("no config file given, using defaults");
      return Ok(Config::default());
    };
    if !path.is_file() {
      return Err(Error::ConfigNotFound(path.display().to_string()));
    }
    let text = std::fs::read_to_string(path)?;
    Self::from_toml(&text)
  }

  /// Parse a TOML document
  pub fn from_toml(text: &str) -> Result<Self> {
    let config: Config = toml::from_str(text)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    for (name, listen) in [
      ("socks", self.socks.listen()),
      ("http_proxy", self.http_proxy.listen()),
      ("watcher", self.watcher.listen()),
    ] {
      if listen.enabled && listen.processes == 0 {
        return Err(Error::Config(format!("{}.processes must be at least 1", name)));
      }
    }
    if self.bus.queue_capacity == 0 {
      return Err(Error::Config("bus.queue_capacity must be at least 1".to_string()));
    }
    if self.counter.backend == CounterBackend::Redis && self.counter.pool_size == 0 {
      return Err(Error::Config("counter.pool_size must be at least 1".to_string()));
    }
    // watchers and proxies run in separate processes
    if self.http_proxy.auth_ip && self.counter.backend == CounterBackend::Memory {
      return Err(Error::Config(
        "http_proxy.auth_ip needs a counter shared between processes, use backend = \"redis\"".to_string(),
      ));
    }
    Ok(())
  }

  /// Upstream connect timeout
  pub fn connect_timeout(&self) -> Duration {
    Duration::from_secs(self.connect_timeout_secs)
  }
}

/// Logging section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// `tracing` filter directive used when `RUST_LOG` is unset
  pub level: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    LogConfig {
      level: "info".to_string(),
    }
  }
}

/// Listening parameters shared by the three proxy-facing services
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listen {
  /// service is started
  pub enabled: bool,
  /// bind host, `*` for every address
  pub host: String,
  /// bind port
  pub port: u16,
  /// listen backlog
  pub backlog: u32,
  /// worker process count
  pub processes: usize,
}

/// SOCKS5 relay section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SocksConfig {
  /// service is started
  pub enabled: bool,
  /// bind host
  pub host: String,
  /// bind port
  pub port: u16,
  /// listen backlog
  pub backlog: u32,
  /// worker process count
  pub processes: usize,
}

impl Default for SocksConfig {
  fn default() -> Self {
    SocksConfig {
      enabled: false,
      host: ANY_HOST.to_string(),
      port: 9999,
      backlog: 128,
      processes: cpu_count(),
    }
  }
}

impl SocksConfig {
  /// Listening parameters
  pub fn listen(&self) -> Listen {
    Listen {
      enabled: self.enabled,
      host: self.host.clone(),
      port: self.port,
      backlog: self.backlog,
      processes: self.processes,
    }
  }
}

/// HTTP forward proxy section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpProxyConfig {
  /// service is started
  pub enabled: bool,
  /// bind host
  pub host: String,
  /// bind port
  pub port: u16,
  /// listen backlog
  pub backlog: u32,
  /// worker process count
  pub processes: usize,
  /// Require a positive watcher count for the client IP
  pub auth_ip: bool,
  /// CONNECT targets resolving to one of these addresses are refused
  pub loop_detection_ips: Vec<String>,
}

impl Default for HttpProxyConfig {
  fn default() -> Self {
    HttpProxyConfig {
      enabled: true,
      host: ANY_HOST.to_string(),
      port: 9997,
      backlog: 128,
      processes: cpu_count(),
      auth_ip: false,
      loop_detection_ips: vec!["127.0.0.1".to_string()],
    }
  }
}

impl HttpProxyConfig {
  /// Listening parameters
  pub fn listen(&self) -> Listen {
    Listen {
      enabled: self.enabled,
      host: self.host.clone(),
      port: self.port,
      backlog: self.backlog,
      processes: self.processes,
    }
  }
}

/// Watcher section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
  /// service is started
  pub enabled: bool,
  /// bind host
  pub host: String,
  /// bind port
  pub port: u16,
  /// listen backlog
  pub backlog: u32,
  /// worker process count
  pub processes: usize,
}

impl Default for WatcherConfig {
  fn default() -> Self {
    WatcherConfig {
      enabled: true,
      host: ANY_HOST.to_string(),
      port: 8080,
      backlog: 64,
      processes: 1,
    }
  }
}

impl WatcherConfig {
  /// Listening parameters
  pub fn listen(&self) -> Listen {
    Listen {
      enabled: self.enabled,
      host: self.host.clone(),
      port: self.port,
      backlog: self.backlog,
      processes: self.processes,
    }
  }
}

/// Admission counter backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterBackend {
  /// redis server speaking RESP
  Redis,
  /// in-process map, only shared by tasks of a single worker; not usable
  /// with `http_proxy.auth_ip`
  Memory,
}

/// Admission counter section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
  /// store implementation
  pub backend: CounterBackend,
  /// redis `host:port`
  pub address: String,
  /// redis connections per worker
  pub pool_size: usize,
}

impl Default for CounterConfig {
  fn default() -> Self {
    CounterConfig {
      backend: CounterBackend::Redis,
      address: "localhost:6379".to_string(),
      pool_size: 5,
    }
  }
}

/// Mirror bus section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
  /// proxy workers publish here
  pub publish_address: String,
  /// watcher sessions subscribe here
  pub subscribe_address: String,
  /// unfiltered capture listener, empty to disable
  pub capture_address: Option<String>,
  /// messages buffered per publisher and per subscriber
  pub queue_capacity: usize,
}

impl Default for BusConfig {
  fn default() -> Self {
    BusConfig {
      publish_address: "127.0.0.1:7999".to_string(),
      subscribe_address: "127.0.0.1:7997".to_string(),
      capture_address: Some("127.0.0.1:7995".to_string()),
      queue_capacity: 4096,
    }
  }
}

/// Worker supervision section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
  /// milliseconds between liveness checks
  pub poll_interval_ms: u64,
}

impl Default for SupervisorConfig {
  fn default() -> Self {
    SupervisorConfig {
      poll_interval_ms: 1000,
    }
  }
}

impl SupervisorConfig {
  /// Delay between liveness checks
  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn empty_document_uses_defaults() {
    let config = Config::from_toml("").unwrap();
    assert!(!config.socks.enabled);
    assert_eq!(config.socks.port, 9999);
    assert!(config.http_proxy.enabled);
    assert_eq!(config.http_proxy.port, 9997);
    assert!(!config.http_proxy.auth_ip);
    assert_eq!(config.http_proxy.loop_detection_ips, vec!["127.0.0.1"]);
    assert_eq!(config.watcher.port, 8080);
    assert_eq!(config.watcher.backlog, 64);
    assert_eq!(config.counter.backend, CounterBackend::Redis);
    assert_eq!(config.counter.pool_size, 5);
    assert_eq!(config.bus.publish_address, "127.0.0.1:7999");
    assert_eq!(config.log.level, "info");
    assert_eq!(config.supervisor.poll_interval(), Duration::from_secs(1));
  }

  #[test]
  fn partial_section_keeps_section_defaults() {
    let config = Config::from_toml(
      r#"
      [socks]
      enabled = true

      [http_proxy]
      port = 3128
      auth_ip = true

      [counter]
      address = "10.0.0.5:6379"
      "#,
    )
    .unwrap();
    assert!(config.socks.enabled);
    assert_eq!(config.socks.port, 9999);
    assert_eq!(config.socks.backlog, 128);
    assert_eq!(config.http_proxy.port, 3128);
    assert!(config.http_proxy.auth_ip);
    assert_eq!(config.http_proxy.host, ANY_HOST);
    assert_eq!(config.counter.backend, CounterBackend::Redis);
    assert_eq!(config.counter.address, "10.0.0.5:6379");
  }

  #[test]
  fn ip_admission_needs_a_shared_counter() {
    let err = Config::from_toml("[http_proxy]\nauth_ip = true\n[counter]\nbackend = \"memory\"\n")
      .unwrap_err();
    assert!(matches!(err, Error::Config(_)));

    let config = Config::from_toml("[counter]\nbackend = \"memory\"\n").unwrap();
    assert_eq!(config.counter.backend, CounterBackend::Memory);
  }

  #[test]
  fn zero_processes_is_rejected() {
    let err = Config::from_toml("[http_proxy]\nprocesses = 0\n").unwrap_err();
    assert!(matches!(err, Error::Config(_)));
  }

  #[test]
  fn load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[watcher]\nport = 18080").unwrap();
    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.watcher.port, 18080);

    let missing = file.path().with_extension("missing");
    assert!(matches!(
      Config::load(Some(&missing)),
      Err(Error::ConfigNotFound(_))
    ));
  }
}
