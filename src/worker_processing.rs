use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::handlers::HandlerRegistry;
use crate::models::Worker;
use crate::restart::RestartSupervisor;
use crate::store::Store;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
  /// Already terminal, deleted by a restart, or started by another consumer.
  Skipped,
  Ran(Vec<Uuid>),
  Failed { restarted: Option<Uuid> },
}

/// Registers this process as a worker consuming `queue`.
pub async fn register_worker(engine: &Engine, queue: &str) -> EngineResult<Worker> {
  let host = hostname::get()
    .ok()
    .and_then(|h| h.into_string().ok())
    .unwrap_or_else(|| "unknown".to_string());
  let worker = Worker::new(queue, host, std::process::id());
  engine.store.register_worker(&worker).await?;
  info!("worker {} registered on {} for queue {}", worker.id, worker.host, queue);
  Ok(worker)
}

pub async fn heartbeat_loop(store: Arc<dyn Store>, worker_id: Uuid, every: Duration) {
  let mut ticker = interval(every);
  loop {
    ticker.tick().await;
    if let Err(e) = store.record_heartbeat(worker_id, Utc::now()).await {
      warn!("heartbeat for worker {} failed: {}", worker_id, e);
    }
  }
}

/// Runs the handler for one delivered task id.
///
/// The task is started with a single conditional update, so of two
/// consumers racing on one id only the winner runs a non-reentrant handler.
/// Handler errors and panics mark the task errored; specification errors
/// also fail the process, anything else goes to the restart supervisor.
pub async fn process_task(
  engine: &Engine,
  registry: &HandlerRegistry,
  task_id: Uuid,
  worker_id: Option<Uuid>,
  execution_id: &str,
) -> EngineResult<DispatchOutcome> {
  let task = match engine.store.get_task(task_id).await {
    Ok(task) => task,
    Err(EngineError::NotFound { .. }) => {
      info!("task {} no longer exists, skipping", task_id);
      return Ok(DispatchOutcome::Skipped);
    }
    Err(e) => return Err(e),
  };
  if task.is_terminal() {
    debug!("task {} already finished, skipping", task_id);
    return Ok(DispatchOutcome::Skipped);
  }

  let handler = registry.get(&task.operation);
  let reentrant = handler.as_ref().is_some_and(|h| h.reentrant());
  // Reentrant tasks park on the queue between deliveries, so no worker owns them.
  let owner = if reentrant { None } else { worker_id };
  let started = engine.store.try_start_task(task.id, owner, Some(execution_id)).await?;
  if !started && !reentrant {
    debug!("task {} already started by another consumer", task_id);
    return Ok(DispatchOutcome::Skipped);
  }
  let task = engine.store.get_task(task_id).await?;

  let result = match handler {
    Some(handler) => AssertUnwindSafe(handler.handle(engine, task.clone()))
      .catch_unwind()
      .await
      .unwrap_or_else(|panic| Err(EngineError::Handler(panic_message(panic.as_ref())))),
    None => Err(EngineError::UnknownOperation(task.operation.clone())),
  };
  match result {
    Ok(launched) => Ok(DispatchOutcome::Ran(launched)),
    Err(e) => {
      let message = e.to_string();
      error!("task {} running {} failed: {}", task.id, task.operation, message);
      engine.error_task(task.id, &message).await?;
      if e.is_specification() {
        engine.store.fail_process(task.parent_process, &message).await?;
        return Ok(DispatchOutcome::Failed { restarted: None });
      }
      let restarted = RestartSupervisor::new(engine).restart(&task, &message).await?;
      Ok(DispatchOutcome::Failed { restarted })
    }
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  let detail = payload
    .downcast_ref::<&str>()
    .map(|s| s.to_string())
    .or_else(|| payload.downcast_ref::<String>().cloned())
    .unwrap_or_else(|| "unknown panic".to_string());
  format!("panicked: {detail}")
}
