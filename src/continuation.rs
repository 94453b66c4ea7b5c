use tracing::{debug, info};
use uuid::Uuid;

use crate::builder::GraphBuilder;
use crate::engine::Engine;
use crate::error::EngineResult;
use crate::models::{Arguments, Task, REDUCE_OPERATION};
use crate::specification::{NodeArguments, OperationNode};

/// Knobs a handler passes when expanding its continuations.
#[derive(Debug, Clone)]
pub struct NextOptions {
  /// Merged into every map child's filters.
  pub inject_filters: Option<Arguments>,
  /// Extra map children launched after the task's own.
  pub custom_next: Vec<OperationNode>,
  pub sync: bool,
  /// When false the task's own map children are skipped; reduce children are still created.
  pub launch_next: bool,
  /// Overrides the batch windows computed per child.
  pub map_filters: Option<Vec<Arguments>>,
}

impl Default for NextOptions {
  fn default() -> Self {
    Self { inject_filters: None, custom_next: Vec::new(), sync: true, launch_next: true, map_filters: None }
  }
}

pub struct ContinuationEngine<'a> {
  engine: &'a Engine,
}

impl<'a> ContinuationEngine<'a> {
  pub fn new(engine: &'a Engine) -> Self {
    Self { engine }
  }

  /// Expands the `map` and `reduce` children carried in a finished task's
  /// arguments. Returns every task id launched.
  pub async fn process_next(&self, task: &Task, options: NextOptions) -> EngineResult<Vec<Uuid>> {
    let next = NodeArguments::from_arguments(&task.arguments)?;
    info!("next tasks for {} ({})", task.operation, task.id);

    if options.sync {
      self.sync_outputs(task).await?;
    }

    let own: &[OperationNode] = if options.launch_next { &next.map } else { &[] };
    let builder = GraphBuilder::new(self.engine);
    let mut launched = Vec::new();
    for child in own.iter().chain(options.custom_next.iter()) {
      let ids = builder
        .launch(child, task, &[], options.inject_filters.as_ref(), options.map_filters.as_deref())
        .await?;
      launched.extend(ids);
    }
    for reduce in &next.reduce {
      launched.push(self.create_reduce(reduce, task).await?);
    }
    Ok(launched)
  }

  async fn sync_outputs(&self, task: &Task) -> EngineResult<()> {
    let settings = &self.engine.settings;
    if settings.media_bucket.is_some() && !settings.cloud_fs_enabled {
      debug!("uploading outputs of {} to remote storage", task.id);
      self.engine.media_sync.upload(task).await?;
    }
    Ok(())
  }

  /// Reduce children are created eagerly on the reducer queue; the barrier
  /// decides later whether they may run.
  async fn create_reduce(&self, node: &OperationNode, parent: &Task) -> EngineResult<Uuid> {
    let mut task = Task::new(
      parent.parent_process,
      REDUCE_OPERATION,
      node.arguments.to_arguments()?,
      self.engine.settings.reducer_queue.clone(),
      node.task_group_id.unwrap_or(-1),
    )
    .with_parent(parent);
    task.video_id = parent.video_id;
    self.engine.submit(&task).await?;
    info!("created reduce task {} below {}", task.id, parent.id);
    Ok(task.id)
  }
}
