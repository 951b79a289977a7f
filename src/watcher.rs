//! Watcher sessions
//!
//! A watcher connects to the watcher listener, sends newline separated
//! commands and receives every mirrored message matching its subscriptions as
//! a bus frame. A subscription matches the messages *sent* by an address:
//! `10.0.0.7` covers every port of that host, `10.0.0.7:51000` one socket.
//!
//! ```text
//! subscribe 10.0.0.7 93.184.216.34:80
//! trigger 10.0.0.7
//! unsubscribe 10.0.0.7
//! ```
//!
//! A *trigger* subscribes to an address and, whenever traffic between that
//! address and some partner shows up, subscribes to the partner as well.
//!
//! [`WatcherSession`] holds the subscription bookkeeping and returns
//! [`Effect`]s; [`WatcherServer`] applies them to the bus and the admission
//! counter.
use crate::bus::{self, BusSubscriber};
use crate::counter::AdmissionCounter;
use crate::errors::{new_io_error, Result};
use crate::topic;
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// A parsed watcher command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
  /// `subscribe <topic>...`
  Subscribe(Vec<String>),
  /// `unsubscribe <topic>...`
  Unsubscribe(Vec<String>),
  /// `trigger <topic>...`
  Trigger(Vec<String>),
}

/// Parse one command line, `None` for unknown commands.
pub fn parse_command(line: &str) -> Option<Command> {
  let mut parts = line.trim_end_matches(['\r', '\n']).split(' ');
  let cmd = parts.next()?;
  let topics: Vec<String> = parts
    .filter(|t| !t.is_empty())
    .map(|t| t.to_string())
    .collect();
  match cmd {
    "subscribe" => Some(Command::Subscribe(topics)),
    "unsubscribe" => Some(Command::Unsubscribe(topics)),
    "trigger" => Some(Command::Trigger(topics)),
    _ => None,
  }
}

/// Side effect requested by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
  /// subscribe to a topic prefix on the bus
  Subscribe(String),
  /// drop a topic prefix subscription
  Unsubscribe(String),
  /// admission counter +1 for this IP
  Increment(String),
  /// admission counter -1 for this IP
  Decrement(String),
}

/// Subscription state of one watcher.
///
/// Every subscription that produced an [`Effect::Increment`] produces exactly
/// one matching [`Effect::Decrement`] once it is released, either by
/// `unsubscribe` or by [`WatcherSession::teardown`]. Increments reported
/// through [`WatcherSession::increment_failed`] are never decremented.
#[derive(Debug, Default)]
pub struct WatcherSession {
  count_ips: bool,
  // successful increments per IP, entries are never zero
  counted: HashMap<String, usize>,
  sub_topics: HashSet<String>,
  sub_triggers: HashSet<String>,
  triggered_sub_topics: HashMap<String, Vec<String>>,
  closed: bool,
}

impl WatcherSession {
  /// New session; counter effects are produced only when `count_ips` is set.
  pub fn new(count_ips: bool) -> Self {
    WatcherSession {
      count_ips,
      ..Default::default()
    }
  }

  /// Currently subscribed topics
  pub fn topics(&self) -> &HashSet<String> {
    &self.sub_topics
  }

  /// Registered triggers
  pub fn triggers(&self) -> &HashSet<String> {
    &self.sub_triggers
  }

  /// Topics discovered through `trigger`
  pub fn triggered_by(&self, trigger: &str) -> &[String] {
    self
      .triggered_sub_topics
      .get(trigger)
      .map(Vec::as_slice)
      .unwrap_or_default()
  }

  /// Apply a command
  pub fn apply(&mut self, command: Command) -> Vec<Effect> {
    let mut effects = Vec::new();
    if self.closed {
      return effects;
    }
    match command {
      Command::Subscribe(topics) => {
        for t in topics {
          self.subscribe(t, &mut effects);
        }
      }
      Command::Unsubscribe(topics) => {
        for t in topics {
          self.unsubscribe(&t, &mut effects);
        }
      }
      Command::Trigger(topics) => {
        for t in topics {
          self.trigger(t, &mut effects);
        }
      }
    }
    effects
  }

  fn subscribe(&mut self, topic: String, effects: &mut Vec<Effect>) -> bool {
    if self.sub_topics.contains(&topic) {
      return false;
    }
    let Some(ip) = topic::endpoint_ip(topic.as_bytes()) else {
      tracing::debug!("[WATCH] Bad topic: {:?}", topic);
      return false;
    };
    tracing::debug!("[WATCH] Adding new topic: {}", topic);
    if self.count_ips {
      *self.counted.entry(ip.to_string()).or_default() += 1;
      effects.push(Effect::Increment(ip.to_string()));
    }
    effects.push(Effect::Subscribe(topic.clone()));
    self.sub_topics.insert(topic);
    true
  }

  fn release(&mut self, topic: &str, effects: &mut Vec<Effect>) {
    if !self.sub_topics.remove(topic) {
      return;
    }
    effects.push(Effect::Unsubscribe(topic.to_string()));
    if self.count_ips {
      if let Some(ip) = topic::endpoint_ip(topic.as_bytes()) {
        if self.uncount(ip) {
          effects.push(Effect::Decrement(ip.to_string()));
        }
      }
    }
  }

  fn uncount(&mut self, ip: &str) -> bool {
    let Some(n) = self.counted.get_mut(ip) else {
      return false;
    };
    *n -= 1;
    if *n == 0 {
      self.counted.remove(ip);
    }
    true
  }

  /// The [`Effect::Increment`] for `ip` did not reach the counter; one fewer
  /// decrement is owed for it.
  pub fn increment_failed(&mut self, ip: &str) {
    self.uncount(ip);
  }

  fn trigger(&mut self, trigger: String, effects: &mut Vec<Effect>) {
    if self.sub_triggers.contains(&trigger) {
      return;
    }
    tracing::debug!("[WATCH] Adding new trigger: {}", trigger);
    self.sub_triggers.insert(trigger.clone());
    self.subscribe(trigger, effects);
  }

  fn unsubscribe(&mut self, topic: &str, effects: &mut Vec<Effect>) {
    tracing::debug!("[WATCH] Unsubscribe: {}", topic);
    self.release(topic, effects);
    if self.sub_triggers.remove(topic) {
      for triggered in self.triggered_sub_topics.remove(topic).unwrap_or_default() {
        self.release(&triggered, effects);
      }
    }
  }

  fn matching_trigger(&self, host: &str, full: &str) -> Option<String> {
    if self.sub_triggers.contains(host) {
      Some(host.to_string())
    } else if self.sub_triggers.contains(full) {
      Some(full.to_string())
    } else {
      None
    }
  }

  /// Inspect a delivered message for trigger partners.
  pub fn on_message(&mut self, msg: &[u8]) -> Vec<Effect> {
    let mut effects = Vec::new();
    if self.closed || self.sub_triggers.is_empty() {
      return effects;
    }
    let Some(decoded) = topic::decode(msg) else {
      return effects;
    };
    let (src_full, dst_full) = (decoded.src.full(), decoded.dst.full());
    for (side, side_full, partner_full) in [
      (&decoded.src, &src_full, &dst_full),
      (&decoded.dst, &dst_full, &src_full),
    ] {
      let Some(trigger) = self.matching_trigger(side.host(), side_full) else {
        continue;
      };
      if self.sub_topics.contains(partner_full) {
        continue;
      }
      tracing::debug!("[WATCH] Adding triggered topic from {}: {}", trigger, partner_full);
      if self.subscribe(partner_full.clone(), &mut effects) {
        self
          .triggered_sub_topics
          .entry(trigger)
          .or_default()
          .push(partner_full.clone());
      }
    }
    effects
  }

  /// Release everything. Later calls return nothing.
  pub fn teardown(&mut self) -> Vec<Effect> {
    let mut effects = Vec::new();
    if self.closed {
      return effects;
    }
    self.closed = true;
    let topics: Vec<String> = self.sub_topics.iter().cloned().collect();
    for t in topics {
      self.release(&t, &mut effects);
    }
    self.sub_triggers.clear();
    self.triggered_sub_topics.clear();
    effects
  }
}

/// Watcher service
#[derive(Clone)]
pub struct WatcherServer {
  bus_address: String,
  counter: Option<Arc<dyn AdmissionCounter>>,
}

impl std::fmt::Debug for WatcherServer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WatcherServer")
      .field("bus_address", &self.bus_address)
      .field("counter", &self.counter.is_some())
      .finish()
  }
}

impl WatcherServer {
  /// Sessions subscribe at `bus_address`; IP counting is on when `counter` is given.
  pub fn new(bus_address: impl Into<String>, counter: Option<Arc<dyn AdmissionCounter>>) -> Self {
    WatcherServer {
      bus_address: bus_address.into(),
      counter,
    }
  }

  /// Accept watchers forever
  pub async fn run(&self, listener: TcpListener) -> Result<()> {
    loop {
      match listener.accept().await {
        Ok((stream, peer_addr)) => {
          let server = self.clone();
          tokio::spawn(async move {
            if let Err(e) = server.handle_connection(stream, peer_addr).await {
              tracing::debug!("[WATCH] {} closed: {}", peer_addr, e);
            }
          });
        }
        Err(e) => {
          tracing::error!("[WATCH] Failed to accept connection: {}", e);
        }
      }
    }
  }

  /// Run one watcher session until either side hangs up.
  pub async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
    let mut bus = BusSubscriber::connect(&self.bus_address).await?;
    tracing::debug!("[WATCH] new session {}", peer_addr);
    let mut session = WatcherSession::new(self.counter.is_some());
    let result = self.serve(stream, &mut session, &mut bus).await;
    let effects = session.teardown();
    self.execute(&mut bus, &mut session, effects).await;
    tracing::debug!("[WATCH] session {} ended", peer_addr);
    result
  }

  async fn serve(
    &self,
    stream: TcpStream,
    session: &mut WatcherSession,
    bus: &mut BusSubscriber,
  ) -> Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    loop {
      tokio::select! {
        line = lines.next_line() => match line? {
          Some(line) => match parse_command(&line) {
            Some(command) => {
              let effects = session.apply(command);
              self.execute(bus, session, effects).await;
            }
            None => tracing::debug!("[WATCH] Unknown command: {:?}", line),
          },
          None => return Ok(()),
        },
        msg = bus.recv() => match msg? {
          Some(msg) => {
            let effects = session.on_message(&msg);
            self.execute(bus, session, effects).await;
            bus::write_frame(&mut writer, &msg).await?;
          }
          None => return Err(new_io_error(ErrorKind::ConnectionAborted, "mirror bus closed")),
        },
      }
    }
  }

  async fn execute(
    &self,
    bus: &mut BusSubscriber,
    session: &mut WatcherSession,
    effects: Vec<Effect>,
  ) {
    for effect in effects {
      let result = match &effect {
        Effect::Subscribe(t) => match topic::subscription_prefix(t.as_bytes()) {
          Some(prefix) => bus.subscribe(&prefix).await,
          None => Ok(()),
        },
        Effect::Unsubscribe(t) => match topic::subscription_prefix(t.as_bytes()) {
          Some(prefix) => bus.unsubscribe(&prefix).await,
          None => Ok(()),
        },
        Effect::Increment(ip) => match &self.counter {
          Some(counter) => {
            let result = counter.increment(ip).await.map(|_| ());
            if result.is_err() {
              session.increment_failed(ip);
            }
            result
          }
          None => Ok(()),
        },
        Effect::Decrement(ip) => match &self.counter {
          Some(counter) => counter.decrement(ip).await.map(|_| ()),
          None => Ok(()),
        },
      };
      if let Err(e) = result {
        tracing::warn!("[WATCH] {:?} failed: {}", effect, e);
      }
    }
  }
}
