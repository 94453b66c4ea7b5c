//! Repository interface over the task/process store.
//!
//! The store is the single source of truth shared by every worker and the
//! management agent. Each state transition is one update keyed by id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::models::{Arguments, Process, Record, Task, TaskRestart, Worker};
use crate::specification::ProcessSpecification;

#[async_trait]
pub trait Store: Send + Sync {
  async fn insert_process(&self, process: &Process) -> EngineResult<()>;
  /// Writes only the specification column; status flags are left to their own transitions.
  async fn update_specification(&self, id: Uuid, specification: &ProcessSpecification) -> EngineResult<()>;
  async fn get_process(&self, id: Uuid) -> EngineResult<Process>;
  async fn incomplete_processes(&self) -> EngineResult<Vec<Process>>;
  async fn fail_process(&self, id: Uuid, message: &str) -> EngineResult<()>;
  /// Sets `completed`. A `failure` is recorded only when the process has not failed already.
  async fn mark_completed(&self, id: Uuid, failure: Option<&str>) -> EngineResult<()>;
  async fn store_query_payload(&self, process_id: Uuid, data: &[u8]) -> EngineResult<()>;

  async fn insert_task(&self, task: &Task) -> EngineResult<()>;
  async fn get_task(&self, id: Uuid) -> EngineResult<Task>;
  async fn delete_task(&self, id: Uuid) -> EngineResult<()>;
  async fn children_of(&self, parent: Uuid) -> EngineResult<Vec<Task>>;
  async fn tasks_for_process(&self, process_id: Uuid) -> EngineResult<Vec<Task>>;
  /// Started but not completed tasks of a process, errored ones included.
  async fn in_flight_tasks(&self, process_id: Uuid) -> EngineResult<Vec<Task>>;
  /// Started, not completed and not yet errored tasks assigned to a worker.
  async fn running_tasks_on_worker(&self, worker_id: Uuid) -> EngineResult<Vec<Task>>;
  /// Flips `started` from false to true. Returns false when another consumer got there first.
  async fn try_start_task(&self, id: Uuid, worker: Option<Uuid>, execution_id: Option<&str>) -> EngineResult<bool>;
  async fn complete_task(&self, id: Uuid, results: Option<Value>) -> EngineResult<()>;
  async fn error_task(&self, id: Uuid, message: &str) -> EngineResult<()>;

  async fn register_worker(&self, worker: &Worker) -> EngineResult<()>;
  async fn get_worker(&self, id: Uuid) -> EngineResult<Worker>;
  async fn record_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> EngineResult<()>;
  async fn alive_workers(&self) -> EngineResult<Vec<Worker>>;
  async fn mark_worker_dead(&self, id: Uuid) -> EngineResult<()>;
  async fn live_queue_names(&self) -> EngineResult<HashSet<String>>;

  async fn insert_restart(&self, restart: &TaskRestart) -> EngineResult<()>;
  async fn restart_for_launched(&self, launched_task_id: Uuid) -> EngineResult<Option<TaskRestart>>;
  async fn restarts_for_process(&self, process_id: Uuid) -> EngineResult<Vec<TaskRestart>>;

  async fn create_record(&self, model: &str, fields: Arguments) -> EngineResult<Uuid>;
  async fn get_record(&self, id: Uuid) -> EngineResult<Option<Record>>;
  /// Equality match on every selector entry; `id`/`pk` match the record id.
  async fn find_record(&self, model: &str, selector: &Arguments) -> EngineResult<Option<Record>>;
  async fn delete_record(&self, model: &str, selector: &Arguments) -> EngineResult<Option<Uuid>>;
}

/// Splits the id component out of a selector. `Err(())` means the selector
/// names an id that cannot match any record.
pub(crate) fn selector_id(selector: &Arguments) -> Result<Option<Uuid>, ()> {
  match selector.get("id").or_else(|| selector.get("pk")) {
    None => Ok(None),
    Some(Value::String(s)) => s.parse().map(Some).map_err(|_| ()),
    Some(_) => Err(()),
  }
}

pub(crate) fn selector_fields(selector: &Arguments) -> Arguments {
  selector
    .iter()
    .filter(|(k, _)| k.as_str() != "id" && k.as_str() != "pk")
    .map(|(k, v)| (k.clone(), v.clone()))
    .collect()
}
