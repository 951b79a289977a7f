#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # slinger-mirror
//!
//! An intercepting SOCKS5 / HTTP proxy for debugging. Every byte it relays is
//! also published, tagged with the conversation it belongs to, on a small
//! pub/sub bus, where watcher sessions pick up the traffic they are interested
//! in.
//!
//! - [`socks5`]: SOCKS5 `CONNECT` relay (no authentication, IPv4 and domain targets)
//! - [`http_proxy`]: HTTP forward proxy with `CONNECT` tunnelling, loop
//!   detection and optional per-IP admission
//! - [`pipe`]: couples two connections and mirrors both directions
//! - [`topic`]: `SRC-DST` topic encoding of mirrored messages
//! - [`bus`]: broker, publisher and subscriber of the mirror bus
//! - [`watcher`]: watcher sessions with `subscribe`, `unsubscribe` and `trigger`
//! - [`counter`]: admission counter shared by watchers and the HTTP proxy
//! - [`supervisor`], [`listener`], [`service`]: multi-process deployment
//!
//! ## Relaying and watching
//!
//! ```no_run
//! use slinger_mirror::bus::BusPublisher;
//! use slinger_mirror::socks5::Socks5Server;
//! use std::time::Duration;
//!
//! # async fn run() -> slinger_mirror::Result<()> {
//! let mirror = BusPublisher::connect("127.0.0.1:7999", 4096);
//! let server = Socks5Server::new(Some(mirror), Duration::from_secs(30));
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:1080").await?;
//! server.run(listener).await
//! # }
//! ```
//!
//! A watcher connects to the watcher listener and sends `subscribe 10.0.0.7`;
//! from then on it receives every message sent by `10.0.0.7` (any port, but
//! not `10.0.0.70`) as a length-prefixed frame
//! `10.0.0.7:51000-93.184.216.34:80:\r\n<bytes>`. Replies travelling back to
//! it are picked up with `trigger 10.0.0.7`, which follows each partner.

pub mod bus;
pub mod config;
pub mod counter;
mod errors;
pub mod http_proxy;
pub mod listener;
pub mod pipe;
pub mod service;
pub mod socks5;
pub mod supervisor;
pub mod topic;
pub mod watcher;

pub use errors::{Error, ReplyCode, Result};
