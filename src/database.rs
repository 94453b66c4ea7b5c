use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use std::collections::HashSet;
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{Arguments, Process, Record, Task, TaskRestart, Worker};
use crate::specification::ProcessSpecification;
use crate::store::{selector_fields, selector_id, Store};

static MIGRATOR: Migrator = sqlx::migrate!();

pub async fn setup_database(database_url: &str) -> anyhow::Result<Pool<Postgres>> {
  let pool = Pool::<Postgres>::connect(database_url).await?;
  MIGRATOR.run(&pool).await?;
  info!("Database migrations complete");
  Ok(pool)
}

const TASK_COLUMNS: &str = "id, operation, arguments, queue, started, completed, errored, error_message, \
  created_at, start_ts, duration, task_group_id, parent_id, process_id, worker_id, execution_id, \
  video_id, training_set_id, results";

const PROCESS_COLUMNS: &str =
  "id, process_type, specification, created_at, completed, failed, error_message, results_available";

const WORKER_COLUMNS: &str = "id, queue_name, host, pid, alive, shutdown, last_heartbeat, created_at";

const RESTART_COLUMNS: &str =
  "id, original_task_id, launched_task_id, attempts, exception, operation, queue, arguments, process_id, created_at";

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
  pool: Pool<Postgres>,
}

impl PgStore {
  pub fn new(pool: Pool<Postgres>) -> Self {
    Self { pool }
  }
}

fn task_from_row(row: &PgRow) -> EngineResult<Task> {
  Ok(Task {
    id: row.try_get("id")?,
    operation: row.try_get("operation")?,
    arguments: row.try_get::<Json<Arguments>, _>("arguments")?.0,
    queue: row.try_get("queue")?,
    started: row.try_get("started")?,
    completed: row.try_get("completed")?,
    errored: row.try_get("errored")?,
    error_message: row.try_get("error_message")?,
    created_at: row.try_get("created_at")?,
    start_ts: row.try_get("start_ts")?,
    duration: row.try_get("duration")?,
    task_group_id: row.try_get("task_group_id")?,
    parent: row.try_get("parent_id")?,
    parent_process: row.try_get("process_id")?,
    worker: row.try_get("worker_id")?,
    execution_id: row.try_get("execution_id")?,
    video_id: row.try_get("video_id")?,
    training_set_id: row.try_get("training_set_id")?,
    results: row.try_get::<Option<Json<Value>>, _>("results")?.map(|j| j.0),
  })
}

fn process_from_row(row: &PgRow) -> EngineResult<Process> {
  let process_type: String = row.try_get("process_type")?;
  Ok(Process {
    id: row.try_get("id")?,
    process_type: process_type.parse()?,
    specification: row.try_get::<Json<ProcessSpecification>, _>("specification")?.0,
    created_at: row.try_get("created_at")?,
    completed: row.try_get("completed")?,
    failed: row.try_get("failed")?,
    error_message: row.try_get("error_message")?,
    results_available: row.try_get("results_available")?,
  })
}

fn worker_from_row(row: &PgRow) -> EngineResult<Worker> {
  let pid: i32 = row.try_get("pid")?;
  Ok(Worker {
    id: row.try_get("id")?,
    queue_name: row.try_get("queue_name")?,
    host: row.try_get("host")?,
    pid: pid as u32,
    alive: row.try_get("alive")?,
    shutdown: row.try_get("shutdown")?,
    last_heartbeat: row.try_get("last_heartbeat")?,
    created_at: row.try_get("created_at")?,
  })
}

fn restart_from_row(row: &PgRow) -> EngineResult<TaskRestart> {
  let attempts: i32 = row.try_get("attempts")?;
  Ok(TaskRestart {
    id: row.try_get("id")?,
    original_task_id: row.try_get("original_task_id")?,
    launched_task_id: row.try_get("launched_task_id")?,
    attempts: attempts as u32,
    exception: row.try_get("exception")?,
    operation: row.try_get("operation")?,
    queue: row.try_get("queue")?,
    arguments: row.try_get::<Json<Arguments>, _>("arguments")?.0,
    process_id: row.try_get("process_id")?,
    created_at: row.try_get("created_at")?,
  })
}

fn record_from_row(row: &PgRow) -> EngineResult<Record> {
  Ok(Record {
    id: row.try_get("id")?,
    model: row.try_get("model")?,
    fields: row.try_get::<Json<Arguments>, _>("fields")?.0,
  })
}

#[async_trait]
impl Store for PgStore {
  async fn insert_process(&self, process: &Process) -> EngineResult<()> {
    sqlx::query(
      "INSERT INTO processes (id, process_type, specification, created_at, completed, failed, error_message, results_available)
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
      .bind(process.id)
      .bind(process.process_type.as_str())
      .bind(Json(&process.specification))
      .bind(process.created_at)
      .bind(process.completed)
      .bind(process.failed)
      .bind(&process.error_message)
      .bind(process.results_available)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn update_specification(&self, id: Uuid, specification: &ProcessSpecification) -> EngineResult<()> {
    sqlx::query("UPDATE processes SET specification = $2 WHERE id = $1")
      .bind(id)
      .bind(Json(specification))
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn get_process(&self, id: Uuid) -> EngineResult<Process> {
    let row = sqlx::query(&format!("SELECT {PROCESS_COLUMNS} FROM processes WHERE id = $1"))
      .bind(id)
      .fetch_optional(&self.pool)
      .await?
      .ok_or(EngineError::NotFound { kind: "process", id })?;
    process_from_row(&row)
  }

  async fn incomplete_processes(&self) -> EngineResult<Vec<Process>> {
    let rows = sqlx::query(&format!("SELECT {PROCESS_COLUMNS} FROM processes WHERE NOT completed ORDER BY created_at"))
      .fetch_all(&self.pool)
      .await?;
    rows.iter().map(process_from_row).collect()
  }

  async fn fail_process(&self, id: Uuid, message: &str) -> EngineResult<()> {
    sqlx::query("UPDATE processes SET failed = TRUE, error_message = $2 WHERE id = $1")
      .bind(id)
      .bind(message)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn mark_completed(&self, id: Uuid, failure: Option<&str>) -> EngineResult<()> {
    sqlx::query(
      "UPDATE processes SET completed = TRUE,
       error_message = CASE WHEN failed OR $2::TEXT IS NULL THEN error_message ELSE $2 END,
       failed = failed OR $2::TEXT IS NOT NULL
       WHERE id = $1",
    )
      .bind(id)
      .bind(failure)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn store_query_payload(&self, process_id: Uuid, data: &[u8]) -> EngineResult<()> {
    sqlx::query(
      "INSERT INTO query_payloads (process_id, data) VALUES ($1, $2)
       ON CONFLICT (process_id) DO UPDATE SET data = EXCLUDED.data",
    )
      .bind(process_id)
      .bind(data)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn insert_task(&self, task: &Task) -> EngineResult<()> {
    sqlx::query(&format!(
      "INSERT INTO tasks ({TASK_COLUMNS})
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)"
    ))
      .bind(task.id)
      .bind(&task.operation)
      .bind(Json(&task.arguments))
      .bind(&task.queue)
      .bind(task.started)
      .bind(task.completed)
      .bind(task.errored)
      .bind(&task.error_message)
      .bind(task.created_at)
      .bind(task.start_ts)
      .bind(task.duration)
      .bind(task.task_group_id)
      .bind(task.parent)
      .bind(task.parent_process)
      .bind(task.worker)
      .bind(&task.execution_id)
      .bind(task.video_id)
      .bind(task.training_set_id)
      .bind(task.results.as_ref().map(Json))
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn get_task(&self, id: Uuid) -> EngineResult<Task> {
    let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
      .bind(id)
      .fetch_optional(&self.pool)
      .await?
      .ok_or(EngineError::NotFound { kind: "task", id })?;
    task_from_row(&row)
  }

  async fn delete_task(&self, id: Uuid) -> EngineResult<()> {
    sqlx::query("DELETE FROM tasks WHERE id = $1")
      .bind(id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn children_of(&self, parent: Uuid) -> EngineResult<Vec<Task>> {
    let rows = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE parent_id = $1 ORDER BY created_at, id"))
      .bind(parent)
      .fetch_all(&self.pool)
      .await?;
    rows.iter().map(task_from_row).collect()
  }

  async fn tasks_for_process(&self, process_id: Uuid) -> EngineResult<Vec<Task>> {
    let rows = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE process_id = $1 ORDER BY created_at, id"))
      .bind(process_id)
      .fetch_all(&self.pool)
      .await?;
    rows.iter().map(task_from_row).collect()
  }

  async fn in_flight_tasks(&self, process_id: Uuid) -> EngineResult<Vec<Task>> {
    let rows = sqlx::query(&format!(
      "SELECT {TASK_COLUMNS} FROM tasks WHERE process_id = $1 AND started AND NOT completed ORDER BY created_at, id"
    ))
      .bind(process_id)
      .fetch_all(&self.pool)
      .await?;
    rows.iter().map(task_from_row).collect()
  }

  async fn running_tasks_on_worker(&self, worker_id: Uuid) -> EngineResult<Vec<Task>> {
    let rows = sqlx::query(&format!(
      "SELECT {TASK_COLUMNS} FROM tasks WHERE worker_id = $1 AND started AND NOT completed AND NOT errored"
    ))
      .bind(worker_id)
      .fetch_all(&self.pool)
      .await?;
    rows.iter().map(task_from_row).collect()
  }

  async fn try_start_task(&self, id: Uuid, worker: Option<Uuid>, execution_id: Option<&str>) -> EngineResult<bool> {
    let result = sqlx::query(
      "UPDATE tasks SET started = TRUE, start_ts = COALESCE(start_ts, NOW()), worker_id = COALESCE(worker_id, $2),
       execution_id = $3
       WHERE id = $1 AND NOT started",
    )
      .bind(id)
      .bind(worker)
      .bind(execution_id)
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected() == 1)
  }

  async fn complete_task(&self, id: Uuid, results: Option<Value>) -> EngineResult<()> {
    sqlx::query(
      "UPDATE tasks SET completed = TRUE, results = COALESCE($2, results),
       duration = CASE WHEN start_ts IS NULL THEN duration
                       ELSE EXTRACT(EPOCH FROM (NOW() - start_ts))::DOUBLE PRECISION END
       WHERE id = $1",
    )
      .bind(id)
      .bind(results.map(Json))
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn error_task(&self, id: Uuid, message: &str) -> EngineResult<()> {
    sqlx::query("UPDATE tasks SET started = TRUE, errored = TRUE, error_message = $2 WHERE id = $1")
      .bind(id)
      .bind(message)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn register_worker(&self, worker: &Worker) -> EngineResult<()> {
    sqlx::query(&format!("INSERT INTO workers ({WORKER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"))
      .bind(worker.id)
      .bind(&worker.queue_name)
      .bind(&worker.host)
      .bind(worker.pid as i32)
      .bind(worker.alive)
      .bind(worker.shutdown)
      .bind(worker.last_heartbeat)
      .bind(worker.created_at)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn get_worker(&self, id: Uuid) -> EngineResult<Worker> {
    let row = sqlx::query(&format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = $1"))
      .bind(id)
      .fetch_optional(&self.pool)
      .await?
      .ok_or(EngineError::NotFound { kind: "worker", id })?;
    worker_from_row(&row)
  }

  async fn record_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> EngineResult<()> {
    sqlx::query("UPDATE workers SET last_heartbeat = $2 WHERE id = $1")
      .bind(id)
      .bind(at)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn alive_workers(&self) -> EngineResult<Vec<Worker>> {
    let rows = sqlx::query(&format!("SELECT {WORKER_COLUMNS} FROM workers WHERE alive"))
      .fetch_all(&self.pool)
      .await?;
    rows.iter().map(worker_from_row).collect()
  }

  async fn mark_worker_dead(&self, id: Uuid) -> EngineResult<()> {
    sqlx::query("UPDATE workers SET alive = FALSE WHERE id = $1")
      .bind(id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn live_queue_names(&self) -> EngineResult<HashSet<String>> {
    let rows = sqlx::query("SELECT DISTINCT queue_name FROM workers WHERE alive")
      .fetch_all(&self.pool)
      .await?;
    rows.iter()
      .map(|row| row.try_get::<String, _>("queue_name").map_err(EngineError::from))
      .collect()
  }

  async fn insert_restart(&self, restart: &TaskRestart) -> EngineResult<()> {
    sqlx::query(&format!("INSERT INTO task_restarts ({RESTART_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"))
      .bind(restart.id)
      .bind(restart.original_task_id)
      .bind(restart.launched_task_id)
      .bind(restart.attempts as i32)
      .bind(&restart.exception)
      .bind(&restart.operation)
      .bind(&restart.queue)
      .bind(Json(&restart.arguments))
      .bind(restart.process_id)
      .bind(restart.created_at)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn restart_for_launched(&self, launched_task_id: Uuid) -> EngineResult<Option<TaskRestart>> {
    let row = sqlx::query(&format!("SELECT {RESTART_COLUMNS} FROM task_restarts WHERE launched_task_id = $1"))
      .bind(launched_task_id)
      .fetch_optional(&self.pool)
      .await?;
    row.as_ref().map(restart_from_row).transpose()
  }

  async fn restarts_for_process(&self, process_id: Uuid) -> EngineResult<Vec<TaskRestart>> {
    let rows = sqlx::query(&format!(
      "SELECT {RESTART_COLUMNS} FROM task_restarts WHERE process_id = $1 ORDER BY created_at"
    ))
      .bind(process_id)
      .fetch_all(&self.pool)
      .await?;
    rows.iter().map(restart_from_row).collect()
  }

  async fn create_record(&self, model: &str, fields: Arguments) -> EngineResult<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO records (id, model, fields) VALUES ($1, $2, $3)")
      .bind(id)
      .bind(model)
      .bind(Json(&fields))
      .execute(&self.pool)
      .await?;
    Ok(id)
  }

  async fn get_record(&self, id: Uuid) -> EngineResult<Option<Record>> {
    let row = sqlx::query("SELECT id, model, fields FROM records WHERE id = $1")
      .bind(id)
      .fetch_optional(&self.pool)
      .await?;
    row.as_ref().map(record_from_row).transpose()
  }

  async fn find_record(&self, model: &str, selector: &Arguments) -> EngineResult<Option<Record>> {
    let Ok(id) = selector_id(selector) else {
      return Ok(None);
    };
    let row = sqlx::query(
      "SELECT id, model, fields FROM records
       WHERE model = $1 AND fields @> $2 AND ($3::UUID IS NULL OR id = $3)
       ORDER BY created_at LIMIT 1",
    )
      .bind(model)
      .bind(Json(selector_fields(selector)))
      .bind(id)
      .fetch_optional(&self.pool)
      .await?;
    row.as_ref().map(record_from_row).transpose()
  }

  async fn delete_record(&self, model: &str, selector: &Arguments) -> EngineResult<Option<Uuid>> {
    let Some(record) = self.find_record(model, selector).await? else {
      return Ok(None);
    };
    sqlx::query("DELETE FROM records WHERE id = $1")
      .bind(record.id)
      .execute(&self.pool)
      .await?;
    Ok(Some(record.id))
  }
}
