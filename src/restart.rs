//! Bounded relaunch of failed tasks.

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::EngineResult;
use crate::models::{Task, TaskRestart};

pub struct RestartSupervisor<'a> {
  engine: &'a Engine,
}

impl<'a> RestartSupervisor<'a> {
  pub fn new(engine: &'a Engine) -> Self {
    Self { engine }
  }

  /// `None` when the operation is not restartable or its chain already has
  /// `max_task_attempts` restarts; the task then stays errored.
  pub async fn restart(&self, task: &Task, exception: &str) -> EngineResult<Option<Uuid>> {
    let settings = &self.engine.settings;
    if !settings.is_restartable(&task.operation) {
      info!("task {} operation {} not restartable", task.id, task.operation);
      return Ok(None);
    }
    let previous = self.engine.store.restart_for_launched(task.id).await?;
    if let Some(exhausted) = previous.as_ref().filter(|p| p.attempts >= settings.max_task_attempts) {
      info!("restart chain {} exceeded {} attempts, not relaunching", exhausted.original_task_id, exhausted.attempts);
      return Ok(None);
    }

    let mut retry = Task::new(
      task.parent_process,
      task.operation.clone(),
      task.arguments.clone(),
      task.queue.clone(),
      task.task_group_id,
    );
    retry.parent = task.parent;
    retry.video_id = task.video_id;
    retry.training_set_id = task.training_set_id;

    let record = TaskRestart {
      id: Uuid::new_v4(),
      original_task_id: previous.as_ref().map_or(task.id, |p| p.original_task_id),
      launched_task_id: retry.id,
      attempts: previous.as_ref().map_or(1, |p| p.attempts + 1),
      exception: exception.to_string(),
      operation: task.operation.clone(),
      queue: task.queue.clone(),
      arguments: task.arguments.clone(),
      process_id: task.parent_process,
      created_at: Utc::now(),
    };
    self.engine.store.insert_task(&retry).await?;
    self.engine.store.insert_restart(&record).await?;
    self.engine
      .transport
      .send(&retry.operation, &[retry.id], &retry.queue, None)
      .await?;
    self.engine.store.delete_task(task.id).await?;
    info!("restarted {} as {} (attempt {})", task.id, retry.id, record.attempts);
    Ok(Some(retry.id))
  }
}
