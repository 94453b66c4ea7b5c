//! Operation handlers. Domain operations are registered by the worker binary;
//! reduce and sync are built in.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::continuation::{ContinuationEngine, NextOptions};
use crate::engine::Engine;
use crate::error::EngineResult;
use crate::models::{Task, REDUCE_OPERATION};
use crate::waiter::{BarrierState, Waiter};

pub const SYNC_OPERATION: &str = "perform_sync";

/// Runs one task and returns the ids it launched downstream. Implementations
/// expand continuations and mark the task completed as their last steps.
#[async_trait]
pub trait OperationHandler: Send + Sync {
  async fn handle(&self, engine: &Engine, task: Task) -> EngineResult<Vec<Uuid>>;

  /// Reentrant handlers run on every delivery, not only the one that started the task.
  fn reentrant(&self) -> bool {
    false
  }
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
  handlers: HashMap<String, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_builtins() -> Self {
    let mut registry = Self::new();
    registry.register(REDUCE_OPERATION, Arc::new(ReduceHandler));
    registry.register(SYNC_OPERATION, Arc::new(SyncHandler));
    registry
  }

  pub fn register(&mut self, operation: impl Into<String>, handler: Arc<dyn OperationHandler>) {
    self.handlers.insert(operation.into(), handler);
  }

  pub fn get(&self, operation: &str) -> Option<Arc<dyn OperationHandler>> {
    self.handlers.get(operation).cloned()
  }
}

/// Evaluates the task's barrier. Pending re-sends the task to its own queue
/// after `timeout` seconds (or the configured reducer timeout).
pub struct ReduceHandler;

#[async_trait]
impl OperationHandler for ReduceHandler {
  async fn handle(&self, engine: &Engine, task: Task) -> EngineResult<Vec<Uuid>> {
    let process = engine.store.get_process(task.parent_process).await?;
    if process.failed {
      engine
        .error_task(task.id, &format!("process {} has failed", process.id))
        .await?;
      return Ok(Vec::new());
    }
    let waiter = Waiter::new(engine.store.as_ref(), &task)?;
    match waiter.evaluate(&process).await? {
      BarrierState::Pending { waiting_on } => {
        let delay = task
          .arguments
          .get("timeout")
          .and_then(Value::as_u64)
          .map(Duration::from_secs)
          .unwrap_or(engine.settings.reducer_timeout);
        info!("reduce {} pending on {}, re-checking in {:?}", task.id, waiting_on, delay);
        engine.transport.send(&task.operation, &[task.id], &task.queue, Some(delay)).await?;
        Ok(Vec::new())
      }
      BarrierState::Satisfied => {
        let launched = ContinuationEngine::new(engine).process_next(&task, NextOptions::default()).await?;
        engine.complete_task(task.id, None).await?;
        Ok(launched)
      }
    }
  }

  fn reentrant(&self) -> bool {
    true
  }
}

pub struct SyncHandler;

#[async_trait]
impl OperationHandler for SyncHandler {
  async fn handle(&self, engine: &Engine, task: Task) -> EngineResult<Vec<Uuid>> {
    if engine.settings.media_bucket.is_some() {
      engine.media_sync.upload(&task).await?;
    } else {
      info!("media bucket not configured, nothing synced for {}", task.id);
    }
    engine.complete_task(task.id, None).await?;
    Ok(Vec::new())
  }
}
