//! Worker process supervision
//!
//! Every listening service runs in one or more OS processes. The supervisor
//! starts them, checks their liveness on a fixed interval and replaces any
//! worker that died abnormally. A worker that exits with status 0 is dropped.
//!
//! There is no restart backoff: a worker that keeps crashing is restarted on
//! every poll.
use crate::errors::{Error, Result};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus};
use std::time::Duration;

/// How to start one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
  /// service name used in logs
  pub name: String,
  /// executable
  pub program: PathBuf,
  /// command line arguments
  pub args: Vec<OsString>,
  /// extra environment on top of the inherited one
  pub env: Vec<(OsString, OsString)>,
  /// descriptors the worker inherits, everything else stays close-on-exec
  pub inherit: Vec<i32>,
}

impl WorkerSpec {
  /// Worker running `program` with `args`
  pub fn new<I, S>(name: impl Into<String>, program: impl Into<PathBuf>, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
  {
    WorkerSpec {
      name: name.into(),
      program: program.into(),
      args: args.into_iter().map(Into::into).collect(),
      env: Vec::new(),
      inherit: Vec::new(),
    }
  }

  /// Add an environment variable
  pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
    self.env.push((key.into(), value.into()));
    self
  }

  /// Let the worker inherit `fds`
  pub fn inherit(mut self, fds: impl IntoIterator<Item = i32>) -> Self {
    self.inherit.extend(fds);
    self
  }

  fn spawn(&self) -> Result<Child> {
    let mut command = Command::new(&self.program);
    command.args(&self.args).envs(self.env.iter().cloned());
    pass_fds(&mut command, &self.inherit);
    command.spawn().map_err(|source| Error::WorkerSpawn {
      target: self.name.clone(),
      source,
    })
  }
}

#[cfg(unix)]
fn pass_fds(command: &mut Command, fds: &[i32]) {
  use std::os::unix::process::CommandExt;
  if fds.is_empty() {
    return;
  }
  let fds = fds.to_vec();
  // SAFETY: the hook only calls fcntl, which is async-signal-safe.
  unsafe {
    command.pre_exec(move || {
      for fd in &fds {
        crate::listener::set_inheritable(*fd)?;
      }
      Ok(())
    });
  }
}

#[cfg(not(unix))]
fn pass_fds(_command: &mut Command, _fds: &[i32]) {}

/// Outcome of one liveness check for a worker
#[derive(Debug)]
pub enum WorkerEvent {
  /// Worker died abnormally and a replacement was started
  Restarted {
    /// service name
    name: String,
    /// exit status of the dead worker
    status: ExitStatus,
    /// pid of the replacement
    pid: u32,
  },
  /// Worker exited cleanly and was removed
  Exited {
    /// service name
    name: String,
  },
  /// A replacement could not be started; retried on the next poll
  SpawnFailed {
    /// service name
    name: String,
    /// why the spawn failed
    error: Error,
  },
}

#[derive(Debug)]
struct Worker {
  spec: WorkerSpec,
  child: Option<Child>,
}

/// The set of supervised workers
#[derive(Debug)]
pub struct Supervisor {
  workers: Vec<Worker>,
  poll_interval: Duration,
}

impl Supervisor {
  /// Empty supervisor checking workers every `poll_interval`
  pub fn new(poll_interval: Duration) -> Self {
    Supervisor {
      workers: Vec::new(),
      poll_interval,
    }
  }

  /// Start `count` workers from `spec`.
  ///
  /// Fails if the first spawn fails; later failures are left to [`Supervisor::poll`].
  pub fn spawn(&mut self, spec: WorkerSpec, count: usize) -> Result<()> {
    for i in 0..count {
      let child = match spec.spawn() {
        Ok(child) => Some(child),
        Err(e) if i == 0 => return Err(e),
        Err(e) => {
          tracing::warn!("[SUPERVISOR] {}", e);
          None
        }
      };
      if let Some(child) = &child {
        tracing::info!("[SUPERVISOR] started {} worker pid {}", spec.name, child.id());
      }
      self.workers.push(Worker {
        spec: spec.clone(),
        child,
      });
    }
    Ok(())
  }

  /// Number of supervised workers
  pub fn len(&self) -> usize {
    self.workers.len()
  }

  /// Whether no worker is left
  pub fn is_empty(&self) -> bool {
    self.workers.is_empty()
  }

  /// Pids of the running workers
  pub fn pids(&self) -> Vec<u32> {
    self
      .workers
      .iter()
      .filter_map(|w| w.child.as_ref().map(Child::id))
      .collect()
  }

  /// One liveness pass over every worker.
  pub fn poll(&mut self) -> Vec<WorkerEvent> {
    let mut events = Vec::new();
    self.workers.retain_mut(|worker| {
      let status = match &mut worker.child {
        Some(child) => match child.try_wait() {
          Ok(None) => return true,
          Ok(Some(status)) => Some(status),
          Err(e) => {
            tracing::warn!("[SUPERVISOR] cannot check {} worker {}: {}", worker.spec.name, child.id(), e);
            return true;
          }
        },
        None => None,
      };
      if let Some(status) = status {
        if status.success() {
          tracing::info!("[SUPERVISOR] {} worker exited", worker.spec.name);
          events.push(WorkerEvent::Exited {
            name: worker.spec.name.clone(),
          });
          return false;
        }
        tracing::warn!("[SUPERVISOR] {} worker died: {}", worker.spec.name, status);
      }
      match worker.spec.spawn() {
        Ok(child) => {
          tracing::warn!("[SUPERVISOR] restarted {} worker pid {}", worker.spec.name, child.id());
          if let Some(status) = status {
            events.push(WorkerEvent::Restarted {
              name: worker.spec.name.clone(),
              status,
              pid: child.id(),
            });
          }
          worker.child = Some(child);
        }
        Err(error) => {
          tracing::error!("[SUPERVISOR] {}", error);
          worker.child = None;
          events.push(WorkerEvent::SpawnFailed {
            name: worker.spec.name.clone(),
            error,
          });
        }
      }
      true
    });
    events
  }

  /// Poll on the configured interval until no worker is left.
  pub async fn monitor(&mut self) {
    while !self.is_empty() {
      tokio::time::sleep(self.poll_interval).await;
      self.poll();
    }
  }
}

impl Drop for Supervisor {
  fn drop(&mut self) {
    for worker in &mut self.workers {
      if let Some(child) = &mut worker.child {
        let _ = child.kill();
        let _ = child.wait();
      }
    }
  }
}
