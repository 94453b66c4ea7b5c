//! In-memory store for tests and single-process runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{Arguments, Process, Record, Task, TaskRestart, Worker};
use crate::specification::ProcessSpecification;
use crate::store::{selector_fields, selector_id, Store};

#[derive(Default)]
struct Inner {
  processes: HashMap<Uuid, Process>,
  tasks: HashMap<Uuid, Task>,
  workers: HashMap<Uuid, Worker>,
  restarts: Vec<TaskRestart>,
  records: HashMap<Uuid, Record>,
  payloads: HashMap<Uuid, Vec<u8>>,
}

#[derive(Default)]
pub struct MemoryStore {
  inner: Mutex<Inner>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> EngineResult<MutexGuard<'_, Inner>> {
    self.inner.lock().map_err(|_| EngineError::Storage("memory store poisoned".into()))
  }

  pub fn query_payload(&self, process_id: Uuid) -> Option<Vec<u8>> {
    self.lock().ok()?.payloads.get(&process_id).cloned()
  }
}

fn sorted(mut tasks: Vec<Task>) -> Vec<Task> {
  tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
  tasks
}

fn matches(record: &Record, model: &str, selector: &Arguments) -> bool {
  if record.model != model {
    return false;
  }
  match selector_id(selector) {
    Ok(Some(id)) if id != record.id => return false,
    Err(()) => return false,
    _ => {}
  }
  selector_fields(selector)
    .iter()
    .all(|(k, v)| record.fields.get(k) == Some(v))
}

#[async_trait]
impl Store for MemoryStore {
  async fn insert_process(&self, process: &Process) -> EngineResult<()> {
    self.lock()?.processes.insert(process.id, process.clone());
    Ok(())
  }

  async fn update_specification(&self, id: Uuid, specification: &ProcessSpecification) -> EngineResult<()> {
    let mut inner = self.lock()?;
    let process = inner.processes.get_mut(&id).ok_or(EngineError::NotFound { kind: "process", id })?;
    process.specification = specification.clone();
    Ok(())
  }

  async fn get_process(&self, id: Uuid) -> EngineResult<Process> {
    self.lock()?
      .processes
      .get(&id)
      .cloned()
      .ok_or(EngineError::NotFound { kind: "process", id })
  }

  async fn incomplete_processes(&self) -> EngineResult<Vec<Process>> {
    Ok(self.lock()?.processes.values().filter(|p| !p.completed).cloned().collect())
  }

  async fn fail_process(&self, id: Uuid, message: &str) -> EngineResult<()> {
    let mut inner = self.lock()?;
    let process = inner.processes.get_mut(&id).ok_or(EngineError::NotFound { kind: "process", id })?;
    process.fail(message);
    Ok(())
  }

  async fn mark_completed(&self, id: Uuid, failure: Option<&str>) -> EngineResult<()> {
    let mut inner = self.lock()?;
    let process = inner.processes.get_mut(&id).ok_or(EngineError::NotFound { kind: "process", id })?;
    process.completed = true;
    if let (Some(message), false) = (failure, process.failed) {
      process.fail(message);
    }
    Ok(())
  }

  async fn store_query_payload(&self, process_id: Uuid, data: &[u8]) -> EngineResult<()> {
    self.lock()?.payloads.insert(process_id, data.to_vec());
    Ok(())
  }

  async fn insert_task(&self, task: &Task) -> EngineResult<()> {
    self.lock()?.tasks.insert(task.id, task.clone());
    Ok(())
  }

  async fn get_task(&self, id: Uuid) -> EngineResult<Task> {
    self.lock()?.tasks.get(&id).cloned().ok_or(EngineError::NotFound { kind: "task", id })
  }

  async fn delete_task(&self, id: Uuid) -> EngineResult<()> {
    self.lock()?.tasks.remove(&id);
    Ok(())
  }

  async fn children_of(&self, parent: Uuid) -> EngineResult<Vec<Task>> {
    let inner = self.lock()?;
    Ok(sorted(inner.tasks.values().filter(|t| t.parent == Some(parent)).cloned().collect()))
  }

  async fn tasks_for_process(&self, process_id: Uuid) -> EngineResult<Vec<Task>> {
    let inner = self.lock()?;
    Ok(sorted(inner.tasks.values().filter(|t| t.parent_process == process_id).cloned().collect()))
  }

  async fn in_flight_tasks(&self, process_id: Uuid) -> EngineResult<Vec<Task>> {
    let inner = self.lock()?;
    Ok(sorted(
      inner.tasks
        .values()
        .filter(|t| t.parent_process == process_id && t.started && !t.completed)
        .cloned()
        .collect(),
    ))
  }

  async fn running_tasks_on_worker(&self, worker_id: Uuid) -> EngineResult<Vec<Task>> {
    let inner = self.lock()?;
    Ok(sorted(
      inner.tasks
        .values()
        .filter(|t| t.worker == Some(worker_id) && t.started && !t.completed && !t.errored)
        .cloned()
        .collect(),
    ))
  }

  async fn try_start_task(&self, id: Uuid, worker: Option<Uuid>, execution_id: Option<&str>) -> EngineResult<bool> {
    let mut inner = self.lock()?;
    let task = inner.tasks.get_mut(&id).ok_or(EngineError::NotFound { kind: "task", id })?;
    if task.started {
      return Ok(false);
    }
    task.started = true;
    task.start_ts.get_or_insert_with(Utc::now);
    if task.worker.is_none() {
      task.worker = worker;
    }
    task.execution_id = execution_id.map(String::from);
    Ok(true)
  }

  async fn complete_task(&self, id: Uuid, results: Option<Value>) -> EngineResult<()> {
    let mut inner = self.lock()?;
    let task = inner.tasks.get_mut(&id).ok_or(EngineError::NotFound { kind: "task", id })?;
    task.completed = true;
    if results.is_some() {
      task.results = results;
    }
    if let Some(start) = task.start_ts {
      task.duration = Some((Utc::now() - start).num_milliseconds() as f64 / 1000.0);
    }
    Ok(())
  }

  async fn error_task(&self, id: Uuid, message: &str) -> EngineResult<()> {
    let mut inner = self.lock()?;
    let task = inner.tasks.get_mut(&id).ok_or(EngineError::NotFound { kind: "task", id })?;
    task.started = true;
    task.errored = true;
    task.error_message = Some(message.to_string());
    Ok(())
  }

  async fn register_worker(&self, worker: &Worker) -> EngineResult<()> {
    self.lock()?.workers.insert(worker.id, worker.clone());
    Ok(())
  }

  async fn get_worker(&self, id: Uuid) -> EngineResult<Worker> {
    self.lock()?.workers.get(&id).cloned().ok_or(EngineError::NotFound { kind: "worker", id })
  }

  async fn record_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> EngineResult<()> {
    let mut inner = self.lock()?;
    let worker = inner.workers.get_mut(&id).ok_or(EngineError::NotFound { kind: "worker", id })?;
    worker.last_heartbeat = at;
    Ok(())
  }

  async fn alive_workers(&self) -> EngineResult<Vec<Worker>> {
    Ok(self.lock()?.workers.values().filter(|w| w.alive).cloned().collect())
  }

  async fn mark_worker_dead(&self, id: Uuid) -> EngineResult<()> {
    let mut inner = self.lock()?;
    let worker = inner.workers.get_mut(&id).ok_or(EngineError::NotFound { kind: "worker", id })?;
    worker.alive = false;
    Ok(())
  }

  async fn live_queue_names(&self) -> EngineResult<HashSet<String>> {
    Ok(self.lock()?.workers.values().filter(|w| w.alive).map(|w| w.queue_name.clone()).collect())
  }

  async fn insert_restart(&self, restart: &TaskRestart) -> EngineResult<()> {
    self.lock()?.restarts.push(restart.clone());
    Ok(())
  }

  async fn restart_for_launched(&self, launched_task_id: Uuid) -> EngineResult<Option<TaskRestart>> {
    Ok(self.lock()?
      .restarts
      .iter()
      .find(|r| r.launched_task_id == launched_task_id)
      .cloned())
  }

  async fn restarts_for_process(&self, process_id: Uuid) -> EngineResult<Vec<TaskRestart>> {
    Ok(self.lock()?.restarts.iter().filter(|r| r.process_id == process_id).cloned().collect())
  }

  async fn create_record(&self, model: &str, fields: Arguments) -> EngineResult<Uuid> {
    let record = Record { id: Uuid::new_v4(), model: model.to_string(), fields };
    let id = record.id;
    self.lock()?.records.insert(id, record);
    Ok(id)
  }

  async fn get_record(&self, id: Uuid) -> EngineResult<Option<Record>> {
    Ok(self.lock()?.records.get(&id).cloned())
  }

  async fn find_record(&self, model: &str, selector: &Arguments) -> EngineResult<Option<Record>> {
    Ok(self.lock()?.records.values().find(|r| matches(r, model, selector)).cloned())
  }

  async fn delete_record(&self, model: &str, selector: &Arguments) -> EngineResult<Option<Uuid>> {
    let mut inner = self.lock()?;
    let id = inner.records.values().find(|r| matches(r, model, selector)).map(|r| r.id);
    if let Some(id) = id {
      inner.records.remove(&id);
    }
    Ok(id)
  }
}
