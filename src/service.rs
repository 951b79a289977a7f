//! Worker entry points
//!
//! A worker process runs exactly one [`Service`] on a current-thread tokio
//! runtime. Proxy and watcher workers accept on listeners inherited from the
//! supervisor; the bus worker binds the broker addresses itself.
use crate::bus::{Broker, BusPublisher};
use crate::config::{Config, Listen};
use crate::counter::{self, AdmissionCounter};
use crate::errors::{new_io_error, Result};
use crate::http_proxy::HttpProxy;
use crate::listener;
use crate::socks5::Socks5Server;
use crate::watcher::WatcherServer;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;

/// Services a worker process can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Service {
  /// SOCKS5 relay
  Socks,
  /// HTTP proxy
  HttpProxy,
  /// Watcher sessions
  Watcher,
  /// Mirror bus broker
  Bus,
}

impl Service {
  /// Name used on the command line and in logs
  pub fn name(&self) -> &'static str {
    match self {
      Service::Socks => "socks",
      Service::HttpProxy => "http-proxy",
      Service::Watcher => "watcher",
      Service::Bus => "bus",
    }
  }

  /// Listener settings, `None` for the bus which binds its own sockets.
  pub fn listen(&self, config: &Config) -> Option<Listen> {
    match self {
      Service::Socks => Some(config.socks.listen()),
      Service::HttpProxy => Some(config.http_proxy.listen()),
      Service::Watcher => Some(config.watcher.listen()),
      Service::Bus => None,
    }
  }
}

impl std::fmt::Display for Service {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.name())
  }
}

/// Run `service` in this process until it fails.
pub fn run_worker(service: Service, config: &Config) -> Result<()> {
  let runtime = tokio::runtime::Builder::new_current_thread()
    .enable_all()
    .build()?;
  runtime.block_on(async {
    match service {
      Service::Bus => Broker::bind(&config.bus).await?.run().await,
      _ => {
        let listeners = listener::inherited_listeners()?;
        serve(service, config, listeners).await
      }
    }
  })
}

/// The admission counter shared by proxies and watchers, when IP admission is on.
pub fn admission_counter(config: &Config) -> Option<Arc<dyn AdmissionCounter>> {
  config
    .http_proxy
    .auth_ip
    .then(|| counter::from_config(&config.counter))
}

/// Serve `service` on already bound listeners. Needs a tokio runtime.
pub async fn serve(service: Service, config: &Config, listeners: Vec<TcpListener>) -> Result<()> {
  let mut tasks = JoinSet::new();
  match service {
    Service::Socks => {
      let mirror = BusPublisher::connect(config.bus.publish_address.clone(), config.bus.queue_capacity);
      let server = Socks5Server::new(Some(mirror), config.connect_timeout());
      for listener in listeners {
        let server = server.clone();
        tasks.spawn(async move { server.run(listener).await });
      }
    }
    Service::HttpProxy => {
      let mirror = BusPublisher::connect(config.bus.publish_address.clone(), config.bus.queue_capacity);
      let proxy = HttpProxy::new(
        &config.http_proxy,
        admission_counter(config),
        Some(mirror),
        config.connect_timeout(),
      );
      for listener in listeners {
        let proxy = proxy.clone();
        tasks.spawn(async move { proxy.run(listener).await });
      }
    }
    Service::Watcher => {
      let server = WatcherServer::new(config.bus.subscribe_address.clone(), admission_counter(config));
      for listener in listeners {
        let server = server.clone();
        tasks.spawn(async move { server.run(listener).await });
      }
    }
    Service::Bus => return Broker::bind(&config.bus).await?.run().await,
  }
  tracing::info!("[WORKER] {} serving", service);
  while let Some(joined) = tasks.join_next().await {
    joined.map_err(|e| new_io_error(ErrorKind::Other, &e.to_string()))??;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use clap::ValueEnum;

  #[test]
  fn names_match_the_command_line() {
    for service in Service::value_variants() {
      let parsed = Service::from_str(service.name(), false).unwrap();
      assert_eq!(&parsed, service);
    }
  }

  #[test]
  fn bus_has_no_inherited_listener() {
    let config = Config::default();
    assert!(Service::Bus.listen(&config).is_none());
    assert_eq!(Service::Watcher.listen(&config).unwrap().port, 8080);
    assert!(admission_counter(&config).is_none());
  }
}
