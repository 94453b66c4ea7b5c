//! Process monitor sweep: restarts in-flight tasks that failed outside
//! their handler and marks processes complete once their forest has drained.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::models::{Process, Task};
use crate::restart::RestartSupervisor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionState {
  Unknown,
  Running,
  Succeeded,
  Failed(String),
}

/// What the queue runtime knows about one delivery of a task.
#[async_trait]
pub trait QueueRuntime: Send + Sync {
  async fn execution_state(&self, execution_id: &str) -> EngineResult<ExecutionState>;
}

/// For transports without a result backend.
pub struct NullRuntime;

#[async_trait]
impl QueueRuntime for NullRuntime {
  async fn execution_state(&self, _execution_id: &str) -> EngineResult<ExecutionState> {
    Ok(ExecutionState::Unknown)
  }
}

#[derive(Default)]
pub struct MemoryRuntime {
  states: Mutex<HashMap<String, ExecutionState>>,
}

impl MemoryRuntime {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(&self, execution_id: impl Into<String>, state: ExecutionState) {
    if let Ok(mut states) = self.states.lock() {
      states.insert(execution_id.into(), state);
    }
  }
}

#[async_trait]
impl QueueRuntime for MemoryRuntime {
  async fn execution_state(&self, execution_id: &str) -> EngineResult<ExecutionState> {
    let states = self.states.lock().map_err(|_| EngineError::Storage("runtime states poisoned".into()))?;
    Ok(states.get(execution_id).cloned().unwrap_or(ExecutionState::Unknown))
  }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProcessSweep {
  pub restarted: Vec<Uuid>,
  pub completed: bool,
}

pub struct ProcessMonitor {
  engine: Engine,
  runtime: Arc<dyn QueueRuntime>,
}

impl ProcessMonitor {
  pub fn new(engine: Engine, runtime: Arc<dyn QueueRuntime>) -> Self {
    Self { engine, runtime }
  }

  pub async fn sweep_all(&self) -> EngineResult<Vec<(Uuid, ProcessSweep)>> {
    let mut swept = Vec::new();
    for process in self.engine.store.incomplete_processes().await? {
      match self.sweep_process(&process).await {
        Ok(sweep) => swept.push((process.id, sweep)),
        Err(e) => error!("monitoring process {} failed: {}", process.id, e),
      }
    }
    Ok(swept)
  }

  pub async fn sweep_process(&self, process: &Process) -> EngineResult<ProcessSweep> {
    let mut sweep = ProcessSweep::default();
    let supervisor = RestartSupervisor::new(&self.engine);
    for task in self.engine.store.in_flight_tasks(process.id).await? {
      let Some(reason) = self.failure_of(&task).await? else {
        continue;
      };
      if !task.errored {
        self.engine.error_task(task.id, &reason).await?;
      }
      if let Some(id) = supervisor.restart(&task, &reason).await? {
        sweep.restarted.push(id);
      }
    }

    let tasks = self.engine.store.tasks_for_process(process.id).await?;
    if tasks.iter().all(Task::is_terminal) {
      let errored = tasks.iter().filter(|t| t.errored).count();
      let failure = (errored > 0).then(|| format!("{errored} tasks errored"));
      self.engine.store.mark_completed(process.id, failure.as_deref()).await?;
      info!("process {} completed with {} errored tasks", process.id, errored);
      sweep.completed = true;
    }
    Ok(sweep)
  }

  /// A started task has failed when the runtime says so for its execution,
  /// or when its worker is no longer alive.
  async fn failure_of(&self, task: &Task) -> EngineResult<Option<String>> {
    if let Some(execution_id) = &task.execution_id {
      if let ExecutionState::Failed(message) = self.runtime.execution_state(execution_id).await? {
        return Ok(Some(message));
      }
    }
    if let Some(worker_id) = task.worker {
      let alive = match self.engine.store.get_worker(worker_id).await {
        Ok(worker) => worker.alive,
        Err(EngineError::NotFound { .. }) => false,
        Err(e) => return Err(e),
      };
      if !alive {
        warn!("task {} lost its worker {}", task.id, worker_id);
        return Ok(Some(format!("worker {worker_id} is no longer alive")));
      }
    }
    Ok(None)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{Arguments, Worker};
  use crate::specification::ProcessSpecification;
  use crate::store::Store;
  use crate::test_support::engine;
  use serde_json::json;

  async fn process(store: &dyn Store) -> Process {
    let spec: ProcessSpecification = serde_json::from_value(json!({"process_type": "process"})).unwrap();
    let process = Process::new(spec);
    store.insert_process(&process).await.unwrap();
    process
  }

  #[tokio::test]
  async fn restarts_tasks_of_dead_workers_and_runtime_failures() {
    let (engine, store, _) = engine();
    let runtime = Arc::new(MemoryRuntime::new());
    let process = process(&*store).await;

    let worker = Worker::new("qextract", "h", 1);
    store.register_worker(&worker).await.unwrap();
    let orphan = Task::new(process.id, "perform_video_decode", Arguments::new(), "qextract", 1);
    store.insert_task(&orphan).await.unwrap();
    store.try_start_task(orphan.id, Some(worker.id), Some("w:1")).await.unwrap();
    store.mark_worker_dead(worker.id).await.unwrap();

    let crashed = Task::new(process.id, "perform_detection", Arguments::new(), "qglobal_model", 2);
    store.insert_task(&crashed).await.unwrap();
    store.try_start_task(crashed.id, None, Some("w:2")).await.unwrap();
    runtime.set("w:2", ExecutionState::Failed("segfault".into()));

    let healthy = Task::new(process.id, "perform_indexing", Arguments::new(), "qglobal_model", 3);
    store.insert_task(&healthy).await.unwrap();
    store.try_start_task(healthy.id, None, Some("w:3")).await.unwrap();
    runtime.set("w:3", ExecutionState::Running);

    let monitor = ProcessMonitor::new(engine, runtime);
    let sweep = monitor.sweep_process(&process).await.unwrap();
    assert_eq!(sweep.restarted.len(), 2);
    assert!(!sweep.completed);
    assert!(store.get_task(orphan.id).await.is_err());
    assert!(store.get_task(crashed.id).await.is_err());
    assert!(store.get_task(healthy.id).await.is_ok());
    let restarts = store.restarts_for_process(process.id).await.unwrap();
    assert!(restarts.iter().any(|r| r.exception == "segfault"));
  }

  #[tokio::test]
  async fn drained_process_completes_and_flags_errors() {
    let (engine, store, _) = engine();
    let process = process(&*store).await;
    let done = Task::new(process.id, "perform_launch", Arguments::new(), "sync", 0);
    store.insert_task(&done).await.unwrap();
    store.complete_task(done.id, None).await.unwrap();
    let failed = Task::new(process.id, "perform_export", Arguments::new(), "qextract", 1);
    store.insert_task(&failed).await.unwrap();

    let monitor = ProcessMonitor::new(engine, Arc::new(NullRuntime));
    assert!(!monitor.sweep_process(&process).await.unwrap().completed);

    store.error_task(failed.id, "disk full").await.unwrap();
    let swept = monitor.sweep_all().await.unwrap();
    assert_eq!(swept.len(), 1);
    assert!(swept[0].1.completed);

    let stored = store.get_process(process.id).await.unwrap();
    assert!(stored.completed);
    assert!(stored.failed);
    assert_eq!(stored.error_message.as_deref(), Some("1 tasks errored"));
    assert!(store.incomplete_processes().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn completion_does_not_overwrite_a_recorded_failure() {
    let (engine, store, _) = engine();
    let process = process(&*store).await;
    let task = Task::new(process.id, "perform_export", Arguments::new(), "qextract", 1);
    store.insert_task(&task).await.unwrap();
    store.error_task(task.id, "disk full").await.unwrap();

    let monitor = ProcessMonitor::new(engine, Arc::new(NullRuntime));
    store.fail_process(process.id, "bad token in filters").await.unwrap();
    assert!(monitor.sweep_process(&process).await.unwrap().completed);

    let stored = store.get_process(process.id).await.unwrap();
    assert!(stored.completed);
    assert_eq!(stored.error_message.as_deref(), Some("bad token in filters"));
  }
}
