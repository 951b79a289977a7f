use clap::{Parser, Subcommand};
use slinger_mirror::config::Config;
use slinger_mirror::listener::{self, LISTEN_FDS_ENV};
use slinger_mirror::service::{self, Service};
use slinger_mirror::supervisor::{Supervisor, WorkerSpec};
use slinger_mirror::Result;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// SOCKS5/HTTP debugging proxy that mirrors relayed traffic to live watchers
#[derive(Parser)]
#[command(name = "slinger-mirror", version, about, args_conflicts_with_subcommands = true)]
struct Cli {
  /// TOML configuration file
  config: Option<PathBuf>,
  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run one service in this process
  #[command(hide = true)]
  Worker {
    #[arg(value_enum)]
    service: Service,
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
  },
}

fn init_logging(level: &str) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
  tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn worker_args(service: Service, config: Option<&Path>) -> Vec<OsString> {
  let mut args = vec![OsString::from("worker"), OsString::from(service.name())];
  if let Some(path) = config {
    args.push(OsString::from("--config"));
    args.push(path.as_os_str().to_owned());
  }
  args
}

fn supervise(config_path: Option<&Path>, config: &Config) -> Result<()> {
  let exe = std::env::current_exe()?;
  let mut supervisor = Supervisor::new(config.supervisor.poll_interval());
  supervisor.spawn(
    WorkerSpec::new(Service::Bus.name(), &exe, worker_args(Service::Bus, config_path)),
    1,
  )?;
  // the parent keeps its copies open so restarted workers can inherit them;
  // each worker inherits only the listeners of its own service
  let mut sockets = Vec::new();
  for service in [Service::Socks, Service::HttpProxy, Service::Watcher] {
    let Some(listen) = service.listen(config) else {
      continue;
    };
    if !listen.enabled {
      continue;
    }
    let listeners = listener::create_listen_sockets(&listen.host, listen.port, listen.backlog)?;
    let fds = listener::listen_fds(&listeners)?;
    tracing::info!(
      "{} listening on {}:{} with {} workers",
      service,
      listen.host,
      listen.port,
      listen.processes
    );
    let spec = WorkerSpec::new(service.name(), &exe, worker_args(service, config_path))
      .env(LISTEN_FDS_ENV, listener::render_fds(&fds))
      .inherit(fds);
    supervisor.spawn(spec, listen.processes)?;
    sockets.extend(listeners);
  }
  let runtime = tokio::runtime::Builder::new_current_thread()
    .enable_all()
    .build()?;
  runtime.block_on(supervisor.monitor());
  drop(sockets);
  Ok(())
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  let (worker, config_path) = match cli.command {
    Some(Commands::Worker { service, config }) => (Some(service), config),
    None => (None, cli.config),
  };
  let config = match Config::load(config_path.as_deref()) {
    Ok(config) => config,
    Err(e) => {
      init_logging("info");
      tracing::error!("{}", e);
      return ExitCode::FAILURE;
    }
  };
  init_logging(&config.log.level);
  let result = match worker {
    Some(service) => service::run_worker(service, &config),
    None => supervise(config_path.as_deref(), &config),
  };
  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      tracing::error!("{}", e);
      ExitCode::FAILURE
    }
  }
}
