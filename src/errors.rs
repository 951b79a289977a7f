//! engine error
use http::StatusCode;
use std::io::ErrorKind;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `slinger_mirror::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while proxying and mirroring traffic.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// Malformed SOCKS5 or HTTP framing, the connection is dropped
  #[error("protocol error: {0}")]
  Protocol(String),
  /// A well-formed HTTP request the proxy refuses to serve
  #[error("bad request: {0}")]
  BadRequest(String),
  /// Request body larger than the proxy buffers
  #[error("request body exceeds {0} bytes")]
  PayloadTooLarge(usize),
  /// Admission check failed for the peer address
  #[error("forbidden: {0}")]
  Forbidden(String),
  /// The proxy target points back at this proxy
  #[error("loop detected for {host}:{port}")]
  LoopDetected {
    /// target host
    host: String,
    /// target port
    port: u16,
  },
  /// Upstream connection could not be established
  #[error("failed to connect to {target}: {source}")]
  UpstreamConnect {
    /// host:port that was dialed
    target: String,
    /// underlying error
    #[source]
    source: std::io::Error,
  },
  /// Mirror message dropped because the bus queue is full
  #[error("mirror bus queue overflow")]
  BusSendOverflow,
  /// An endpoint was attached to a second pipe
  #[error("endpoint already attached to a pipe")]
  AlreadyPiped,
  /// Admission counter store error
  #[error("counter store: {0}")]
  Counter(String),
  /// Invalid configuration
  #[error("config: {0}")]
  Config(String),
  /// Configuration file is missing
  #[error("no such file: '{0}'")]
  ConfigNotFound(String),
  /// toml::de::Error
  #[error(transparent)]
  Toml(#[from] toml::de::Error),
  /// Worker process could not be started
  #[error("failed to spawn worker {target}: {source}")]
  WorkerSpawn {
    /// service name
    target: String,
    /// underlying error
    #[source]
    source: std::io::Error,
  },
}

/// SOCKS5 reply field values sent back to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
  /// Succeeded
  Succeeded,
  /// General failure
  GeneralFailure,
  /// Command not supported
  CommandNotSupported,
  /// Address type not supported
  AddressTypeNotSupported,
}

impl ReplyCode {
  /// Wire value of the reply code
  pub fn as_u8(&self) -> u8 {
    match self {
      ReplyCode::Succeeded => 0x00,
      ReplyCode::GeneralFailure => 0x01,
      ReplyCode::CommandNotSupported => 0x07,
      ReplyCode::AddressTypeNotSupported => 0x08,
    }
  }
}

impl Error {
  /// Create a protocol error and log it
  pub fn protocol_error(msg: impl Into<String>) -> Self {
    let error = Error::Protocol(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a bad request error and log it
  pub fn bad_request(msg: impl Into<String>) -> Self {
    let error = Error::BadRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a counter store error and log it
  pub fn counter_error(msg: impl Into<String>) -> Self {
    let error = Error::Counter(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an upstream connect error and log it
  pub fn upstream_connect(target: impl Into<String>, source: std::io::Error) -> Self {
    let error = Error::UpstreamConnect {
      target: target.into(),
      source,
    };
    tracing::debug!("{}", error);
    error
  }

  /// The status an HTTP proxy client sees for this error, if any.
  pub fn status_code(&self) -> Option<StatusCode> {
    match self {
      Error::Protocol(_) | Error::BadRequest(_) | Error::Http(_) => Some(StatusCode::BAD_REQUEST),
      Error::Forbidden(_) => Some(StatusCode::FORBIDDEN),
      Error::PayloadTooLarge(_) => Some(StatusCode::PAYLOAD_TOO_LARGE),
      Error::LoopDetected { .. } => Some(StatusCode::BAD_GATEWAY),
      Error::UpstreamConnect { .. } => Some(StatusCode::INTERNAL_SERVER_ERROR),
      _ => None,
    }
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}
