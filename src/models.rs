use serde::{Serialize, Deserialize};
use serde_json::Value;
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;
use crate::specification::ProcessSpecification;

/// Task arguments. Always owned: every derived mapping is a fresh value.
pub type Arguments = serde_json::Map<String, Value>;

pub const LAUNCH_OPERATION: &str = "perform_launch";
pub const CREATE_OPERATION: &str = "perform_create";
pub const REDUCE_OPERATION: &str = "perform_reduce";
pub const SYNC_QUEUE: &str = "sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
  Schedule,
  Process,
  Query,
}

impl ProcessType {
  pub fn as_str(&self) -> &'static str {
    match self {
      ProcessType::Schedule => "schedule",
      ProcessType::Process => "process",
      ProcessType::Query => "query",
    }
  }
}

impl fmt::Display for ProcessType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ProcessType {
  type Err = EngineError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "schedule" => Ok(ProcessType::Schedule),
      "process" => Ok(ProcessType::Process),
      "query" => Ok(ProcessType::Query),
      other => Err(EngineError::spec(format!("unknown process_type {other}"))),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
  pub id: Uuid,
  pub process_type: ProcessType,
  pub specification: ProcessSpecification,
  pub created_at: DateTime<Utc>,
  pub completed: bool,
  pub failed: bool,
  pub error_message: Option<String>,
  pub results_available: bool,
}

impl Process {
  pub fn new(specification: ProcessSpecification) -> Self {
    Self {
      id: Uuid::new_v4(),
      process_type: specification.process_type,
      specification,
      created_at: Utc::now(),
      completed: false,
      failed: false,
      error_message: None,
      results_available: false,
    }
  }

  pub fn fail(&mut self, message: impl Into<String>) {
    self.failed = true;
    self.error_message = Some(message.into());
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
  pub id: Uuid,
  pub operation: String,
  pub arguments: Arguments,
  pub queue: String,
  pub started: bool,
  pub completed: bool,
  pub errored: bool,
  pub error_message: Option<String>,
  pub created_at: DateTime<Utc>,
  pub start_ts: Option<DateTime<Utc>>,
  /// Seconds between start and completion.
  pub duration: Option<f64>,
  pub task_group_id: i64,
  pub parent: Option<Uuid>,
  pub parent_process: Uuid,
  pub worker: Option<Uuid>,
  /// Identifier of the queue delivery that started this task.
  pub execution_id: Option<String>,
  pub video_id: Option<Uuid>,
  pub training_set_id: Option<Uuid>,
  pub results: Option<Value>,
}

impl Task {
  pub fn new(
    parent_process: Uuid,
    operation: impl Into<String>,
    arguments: Arguments,
    queue: impl Into<String>,
    task_group_id: i64,
  ) -> Self {
    Self {
      id: Uuid::new_v4(),
      operation: operation.into(),
      arguments,
      queue: queue.into(),
      started: false,
      completed: false,
      errored: false,
      error_message: None,
      created_at: Utc::now(),
      start_ts: None,
      duration: None,
      task_group_id,
      parent: None,
      parent_process,
      worker: None,
      execution_id: None,
      video_id: None,
      training_set_id: None,
      results: None,
    }
  }

  pub fn with_parent(mut self, parent: &Task) -> Self {
    self.parent = Some(parent.id);
    self
  }

  pub fn is_terminal(&self) -> bool {
    self.completed || self.errored
  }

  pub fn is_reduce(&self) -> bool {
    self.operation == REDUCE_OPERATION
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Worker {
  pub id: Uuid,
  pub queue_name: String,
  pub host: String,
  pub pid: u32,
  pub alive: bool,
  pub shutdown: bool,
  pub last_heartbeat: DateTime<Utc>,
  pub created_at: DateTime<Utc>,
}

impl Worker {
  pub fn new(queue_name: impl Into<String>, host: impl Into<String>, pid: u32) -> Self {
    let now = Utc::now();
    Self {
      id: Uuid::new_v4(),
      queue_name: queue_name.into(),
      host: host.into(),
      pid,
      alive: true,
      shutdown: false,
      last_heartbeat: now,
      created_at: now,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRestart {
  pub id: Uuid,
  /// First task of the retry chain; unchanged across restarts.
  pub original_task_id: Uuid,
  pub launched_task_id: Uuid,
  pub attempts: u32,
  pub exception: String,
  pub operation: String,
  pub queue: String,
  pub arguments: Arguments,
  pub process_id: Uuid,
  pub created_at: DateTime<Utc>,
}

/// A domain record (video, trained model, retriever, training set, ...) the
/// engine only needs to look up by selector or create from a specification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
  pub id: Uuid,
  pub model: String,
  pub fields: Arguments,
}

impl Record {
  pub fn count(&self, field: &str) -> u64 {
    self.fields.get(field).and_then(Value::as_u64).unwrap_or(0)
  }
}
