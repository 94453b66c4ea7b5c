use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::error::EngineResult;
use crate::messaging::QueueTransport;
use crate::models::Task;
use crate::router::QueueRouter;
use crate::store::Store;

/// Pushes a finished task's outputs to remote media storage.
#[async_trait]
pub trait MediaSync: Send + Sync {
  async fn upload(&self, task: &Task) -> EngineResult<()>;
}

pub struct NoopSync;

#[async_trait]
impl MediaSync for NoopSync {
  async fn upload(&self, _task: &Task) -> EngineResult<()> {
    Ok(())
  }
}

/// Everything a component needs, built once per worker or agent process.
#[derive(Clone)]
pub struct Engine {
  pub store: Arc<dyn Store>,
  pub transport: Arc<dyn QueueTransport>,
  pub router: Arc<QueueRouter>,
  pub settings: Arc<EngineSettings>,
  pub media_sync: Arc<dyn MediaSync>,
}

impl Engine {
  pub fn new(store: Arc<dyn Store>, transport: Arc<dyn QueueTransport>, settings: EngineSettings) -> Self {
    let settings = Arc::new(settings);
    Self {
      router: Arc::new(QueueRouter::new(store.clone(), settings.clone())),
      store,
      transport,
      settings,
      media_sync: Arc::new(NoopSync),
    }
  }

  pub fn with_media_sync(mut self, media_sync: Arc<dyn MediaSync>) -> Self {
    self.media_sync = media_sync;
    self
  }

  /// Persists a task and hands its id to the queue.
  pub async fn submit(&self, task: &Task) -> EngineResult<()> {
    self.store.insert_task(task).await?;
    self.transport.send(&task.operation, &[task.id], &task.queue, None).await
  }

  pub async fn complete_task(&self, id: Uuid, results: Option<Value>) -> EngineResult<()> {
    self.store.complete_task(id, results).await?;
    info!("task {} completed", id);
    Ok(())
  }

  pub async fn error_task(&self, id: Uuid, message: &str) -> EngineResult<()> {
    self.store.error_task(id, message).await?;
    warn!("task {} errored: {}", id, message);
    Ok(())
  }
}
