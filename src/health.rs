//! Worker liveness sweep, run periodically by the management agent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, System};
use tokio::process::Command;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::EngineResult;
use crate::models::Worker;

/// Answers whether a pid is still running on this host.
pub trait ProcessProbe: Send + Sync {
  fn is_running(&self, pid: u32) -> bool;
}

pub struct SysinfoProbe {
  system: Mutex<System>,
}

impl SysinfoProbe {
  pub fn new() -> Self {
    Self { system: Mutex::new(System::new()) }
  }
}

impl Default for SysinfoProbe {
  fn default() -> Self {
    Self::new()
  }
}

impl ProcessProbe for SysinfoProbe {
  fn is_running(&self, pid: u32) -> bool {
    match self.system.lock() {
      Ok(mut system) => system.refresh_process(Pid::from_u32(pid)),
      // Without a probe we cannot prove the process is gone.
      Err(_) => true,
    }
  }
}

/// Starts a replacement consumer for a queue.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
  async fn launch(&self, queue: &str) -> EngineResult<()>;
}

/// Spawns `program <queue>` as a detached child.
pub struct CommandLauncher {
  program: PathBuf,
}

impl CommandLauncher {
  pub fn new(program: impl Into<PathBuf>) -> Self {
    Self { program: program.into() }
  }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
  async fn launch(&self, queue: &str) -> EngineResult<()> {
    let child = Command::new(&self.program)
      .arg(queue)
      .stdin(Stdio::null())
      .spawn()?;
    info!("launched {} for {} as pid {:?}", self.program.display(), queue, child.id());
    Ok(())
  }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct HealthReport {
  pub dead: Vec<Uuid>,
  pub errored_tasks: Vec<Uuid>,
  pub relaunched: Vec<String>,
  /// Host-managed mode: the agent should exit and let the scheduler replace it.
  pub exit_requested: bool,
}

pub struct WorkerHealthMonitor {
  engine: Engine,
  host: String,
  probe: Arc<dyn ProcessProbe>,
  launcher: Arc<dyn WorkerLauncher>,
}

impl WorkerHealthMonitor {
  pub fn new(engine: Engine, host: impl Into<String>, probe: Arc<dyn ProcessProbe>, launcher: Arc<dyn WorkerLauncher>) -> Self {
    Self { engine, host: host.into(), probe, launcher }
  }

  pub async fn sweep(&self, now: DateTime<Utc>) -> EngineResult<HealthReport> {
    let mut report = HealthReport::default();
    for worker in self.engine.store.alive_workers().await? {
      if worker.shutdown {
        continue;
      }
      let Some(reason) = self.death_reason(&worker, now) else {
        continue;
      };
      warn!("worker {} on {} processing {} is dead: {}", worker.id, worker.host, worker.queue_name, reason);
      self.engine.store.mark_worker_dead(worker.id).await?;
      report.dead.push(worker.id);

      let message = format!("worker {} processing {} died: {}", worker.id, worker.queue_name, reason);
      for task in self.engine.store.running_tasks_on_worker(worker.id).await? {
        self.engine.error_task(task.id, &message).await?;
        report.errored_tasks.push(task.id);
      }

      if worker.queue_name == self.engine.settings.manager_queue {
        continue;
      }
      if self.engine.settings.kube_mode {
        report.exit_requested = true;
      } else {
        match self.launcher.launch(&worker.queue_name).await {
          Ok(()) => report.relaunched.push(worker.queue_name.clone()),
          Err(e) => error!("could not relaunch worker for {}: {}", worker.queue_name, e),
        }
      }
    }
    Ok(report)
  }

  fn death_reason(&self, worker: &Worker, now: DateTime<Utc>) -> Option<&'static str> {
    let stale = (now - worker.last_heartbeat)
      .to_std()
      .map(|age| age > self.engine.settings.heartbeat_timeout)
      .unwrap_or(false);
    if stale {
      return Some("heartbeat timed out");
    }
    if worker.host == self.host && !self.probe.is_running(worker.pid) {
      return Some("process is gone");
    }
    None
  }
}
