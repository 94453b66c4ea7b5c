//! Queue resolution for operations.
//!
//! Order: explicit `queue` argument, static system table, then the per-model
//! or per-retriever queue named by the selector in the arguments. A per-model
//! queue without a live worker falls back to the shared global queue of its
//! category when that queue is enabled.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::EngineSettings;
use crate::error::{EngineError, EngineResult};
use crate::models::Arguments;
use crate::store::Store;

pub const MODEL_QUEUE_PREFIX: &str = "q_model_";
pub const RETRIEVER_QUEUE_PREFIX: &str = "q_retriever_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueCategory {
  Model,
  Retriever,
}

#[derive(Default)]
struct LiveQueues {
  names: HashSet<String>,
  refreshed_at: Option<Instant>,
}

/// Constructed once per process and shared; the live-queue cache lives here
/// instead of in globals.
pub struct QueueRouter {
  store: Arc<dyn Store>,
  settings: Arc<EngineSettings>,
  live: RwLock<LiveQueues>,
}

impl QueueRouter {
  pub fn new(store: Arc<dyn Store>, settings: Arc<EngineSettings>) -> Self {
    Self { store, settings, live: RwLock::new(LiveQueues::default()) }
  }

  pub async fn resolve(&self, operation: &str, arguments: &Arguments) -> EngineResult<String> {
    if let Some(queue) = arguments.get("queue").and_then(Value::as_str) {
      return Ok(queue.to_string());
    }
    if let Some(queue) = self.settings.operation_queues.get(operation) {
      return Ok(queue.clone());
    }
    let (queue, category) = self.model_specific_queue(operation, arguments).await?;
    if self.is_live(&queue).await? {
      return Ok(queue);
    }
    let fallback = match category {
      QueueCategory::Retriever if self.settings.global_retriever_enabled => Some(&self.settings.global_retriever_queue),
      QueueCategory::Model if self.settings.global_model_enabled => Some(&self.settings.global_model_queue),
      _ => None,
    };
    match fallback {
      Some(global) => {
        info!("no live worker on {}, routing {} to {}", queue, operation, global);
        Ok(global.clone())
      }
      None => Ok(queue),
    }
  }

  async fn model_specific_queue(&self, operation: &str, arguments: &Arguments) -> EngineResult<(String, QueueCategory)> {
    if let Some(selector) = arguments.get("trainedmodel_selector") {
      let record = self.lookup("TrainedModel", selector).await?;
      return Ok((format!("{MODEL_QUEUE_PREFIX}{record}"), QueueCategory::Model));
    }
    if let Some(selector) = arguments.get("retriever_selector") {
      let record = self.lookup("Retriever", selector).await?;
      return Ok((format!("{RETRIEVER_QUEUE_PREFIX}{record}"), QueueCategory::Retriever));
    }
    Err(EngineError::spec(format!(
      "{operation} is not a system operation and names no trainedmodel_selector or retriever_selector"
    )))
  }

  async fn lookup(&self, model: &str, selector: &Value) -> EngineResult<uuid::Uuid> {
    let selector = selector
      .as_object()
      .ok_or_else(|| EngineError::spec(format!("{model} selector must be an object")))?;
    self.store
      .find_record(model, selector)
      .await?
      .map(|r| r.id)
      .ok_or_else(|| EngineError::spec(format!("no {model} matches selector {}", Value::Object(selector.clone()))))
  }

  async fn is_live(&self, queue: &str) -> EngineResult<bool> {
    {
      let live = self.live.read().await;
      if let Some(at) = live.refreshed_at {
        if at.elapsed() < self.settings.queue_refresh_interval {
          return Ok(live.names.contains(queue));
        }
      }
    }
    let names = self.store.live_queue_names().await?;
    debug!("refreshed live queues: {:?}", names);
    let mut live = self.live.write().await;
    live.names = names;
    live.refreshed_at = Some(Instant::now());
    Ok(live.names.contains(queue))
  }

  /// Forces the next resolution to reload live queue names.
  pub async fn invalidate(&self) {
    self.live.write().await.refreshed_at = None;
  }
}
