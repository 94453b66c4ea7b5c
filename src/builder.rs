use regex::Regex;
use serde_json::{json, Value};
use std::sync::LazyLock;
use tracing::info;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::models::{Arguments, Record, Task};
use crate::specification::OperationNode;
use crate::substitutor::substitute;

static CREATED_REF: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^__created__(\d+)$").expect("valid regex"));

pub struct GraphBuilder<'a> {
  engine: &'a Engine,
}

impl<'a> GraphBuilder<'a> {
  pub fn new(engine: &'a Engine) -> Self {
    Self { engine }
  }

  /// One task per batch window. Without `map_filters` the windows come from
  /// the node's batch-size hint.
  pub async fn launch(
    &self,
    node: &OperationNode,
    parent: &Task,
    created: &[Uuid],
    inject_filters: Option<&Arguments>,
    map_filters: Option<&[Arguments]>,
  ) -> EngineResult<Vec<Uuid>> {
    let operation = node.operation()?;
    let mut base = node.arguments.to_arguments()?;
    resolve_created_refs(&mut base, created)?;
    let video_id = self.resolve_video(node, operation, &base, parent, created).await?;
    let training_set_id = self.resolve_training_set(node, &base, parent, created).await?;

    let computed;
    let windows = match map_filters {
      Some(filters) => filters,
      None => {
        let video = match video_id {
          Some(id) => self.engine.store.get_record(id).await?,
          None => None,
        };
        computed = batch_filters(&node.arguments.fields, video.as_ref())?;
        &computed[..]
      }
    };

    let mut launched = Vec::with_capacity(windows.len());
    for window in windows {
      let arguments = substitute(&base, parent, inject_filters, window)?;
      let queue = self.engine.router.resolve(operation, &arguments).await?;
      let mut task = Task::new(parent.parent_process, operation, arguments, queue, node.task_group_id.unwrap_or(-1))
        .with_parent(parent);
      task.video_id = video_id;
      task.training_set_id = training_set_id;
      info!("launching {} -> {} on {} with filters {:?}", parent.operation, operation, task.queue, window);
      self.engine.submit(&task).await?;
      launched.push(task.id);
    }
    Ok(launched)
  }

  pub async fn launch_detached(&self, node: &OperationNode, process_id: Uuid) -> EngineResult<Uuid> {
    let operation = node.operation()?;
    let arguments = node.arguments.to_arguments()?;
    let queue = self.engine.router.resolve(operation, &arguments).await?;
    let task = Task::new(process_id, operation, arguments, queue, node.task_group_id.unwrap_or(-1));
    info!("launching query task {} on {}", operation, task.queue);
    self.engine.submit(&task).await?;
    Ok(task.id)
  }

  async fn resolve_video(
    &self,
    node: &OperationNode,
    operation: &str,
    arguments: &Arguments,
    parent: &Task,
    created: &[Uuid],
  ) -> EngineResult<Option<Uuid>> {
    if self.engine.settings.non_processing_operations.contains(operation) {
      return Ok(None);
    }
    if let Some(binding) = &node.video_id {
      return resolve_binding(binding, created).map(Some);
    }
    if let Some(selector) = arguments.get("video_selector") {
      return self.select("Video", selector).await.map(Some);
    }
    Ok(parent.video_id)
  }

  async fn resolve_training_set(
    &self,
    node: &OperationNode,
    arguments: &Arguments,
    parent: &Task,
    created: &[Uuid],
  ) -> EngineResult<Option<Uuid>> {
    if let Some(binding) = &node.training_set_id {
      return resolve_binding(binding, created).map(Some);
    }
    if let Some(selector) = arguments.get("trainingset_selector") {
      return self.select("TrainingSet", selector).await.map(Some);
    }
    Ok(parent.training_set_id)
  }

  async fn select(&self, model: &str, selector: &Value) -> EngineResult<Uuid> {
    let fields = selector
      .as_object()
      .ok_or_else(|| EngineError::spec(format!("{model} selector must be an object")))?;
    self.engine
      .store
      .find_record(model, fields)
      .await?
      .map(|r| r.id)
      .ok_or_else(|| EngineError::spec(format!("no {model} matches {selector}")))
  }
}

pub fn resolve_binding(binding: &Value, created: &[Uuid]) -> EngineResult<Uuid> {
  let text = binding
    .as_str()
    .ok_or_else(|| EngineError::spec(format!("binding {binding} must be a string")))?;
  if let Some(id) = created_ref(text, created)? {
    return Ok(id);
  }
  text.parse().map_err(|_| EngineError::spec(format!("binding {text} is not a record id")))
}

fn created_ref(text: &str, created: &[Uuid]) -> EngineResult<Option<Uuid>> {
  let Some(captures) = CREATED_REF.captures(text) else {
    return Ok(None);
  };
  let index: usize = captures[1]
    .parse()
    .map_err(|_| EngineError::spec(format!("bad back-reference {text}")))?;
  created
    .get(index)
    .copied()
    .map(Some)
    .ok_or_else(|| EngineError::spec(format!("{text} refers past the {} created records", created.len())))
}

/// Replaces top-level `__created__N` argument values with the created record ids.
pub fn resolve_created_refs(arguments: &mut Arguments, created: &[Uuid]) -> EngineResult<()> {
  for value in arguments.values_mut() {
    let resolved = match value.as_str() {
      Some(text) => created_ref(text, created)?,
      None => None,
    };
    if let Some(id) = resolved {
      *value = Value::String(id.to_string());
    }
  }
  Ok(())
}

/// Like `resolve_created_refs`, for bindings and arguments of a whole node tree.
pub fn resolve_created_tree(nodes: &mut [OperationNode], created: &[Uuid]) -> EngineResult<()> {
  for node in nodes.iter_mut() {
    for binding in [&mut node.video_id, &mut node.training_set_id].into_iter().flatten() {
      let resolved = match binding.as_str() {
        Some(text) => created_ref(text, created)?,
        None => None,
      };
      if let Some(id) = resolved {
        *binding = Value::String(id.to_string());
      }
    }
    resolve_created_refs(&mut node.arguments.fields, created)?;
    resolve_created_tree(&mut node.arguments.map, created)?;
    resolve_created_tree(&mut node.arguments.reduce, created)?;
  }
  Ok(())
}

/// Batch windows for a node targeting `video`, from `segments_batch_size` or
/// `frames_batch_size`. Without a hint (or a video) there is one empty filter.
pub fn batch_filters(fields: &Arguments, video: Option<&Record>) -> EngineResult<Vec<Arguments>> {
  let Some(video) = video else {
    return Ok(vec![Arguments::new()]);
  };
  let (hint, total, key) = if let Some(step) = fields.get("segments_batch_size") {
    (step, video.count("segments"), "segment_index")
  } else if let Some(step) = fields.get("frames_batch_size") {
    (step, video.count("frames"), "frame_index")
  } else {
    return Ok(vec![Arguments::new()]);
  };
  let step = hint
    .as_u64()
    .filter(|s| *s > 0)
    .ok_or_else(|| EngineError::spec(format!("batch size {hint} must be a positive integer")))?;
  Ok(batch_windows(total, step, key))
}

// The last window has no upper bound.
pub fn batch_windows(total: u64, step: u64, key: &str) -> Vec<Arguments> {
  if total == 0 {
    return vec![Arguments::new()];
  }
  (0..total)
    .step_by(step as usize)
    .map(|start| {
      let mut window = Arguments::new();
      window.insert(format!("{key}__gte"), json!(start));
      if start + step < total {
        window.insert(format!("{key}__lt"), json!(start + step));
      }
      window
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::Store;
  use crate::test_support::{args, engine};

  #[test]
  fn frames_batches_end_open() {
    let windows = batch_windows(95, 30, "frame_index");
    assert_eq!(windows.len(), 4);
    assert_eq!(Value::Object(windows[0].clone()), json!({"frame_index__gte": 0, "frame_index__lt": 30}));
    assert_eq!(Value::Object(windows[2].clone()), json!({"frame_index__gte": 60, "frame_index__lt": 90}));
    assert_eq!(Value::Object(windows[3].clone()), json!({"frame_index__gte": 90}));
  }

  #[test]
  fn exact_multiple_leaves_last_window_open() {
    let windows = batch_windows(90, 30, "segment_index");
    assert_eq!(windows.len(), 3);
    assert_eq!(Value::Object(windows[2].clone()), json!({"segment_index__gte": 60}));
  }

  #[test]
  fn missing_hint_or_video_gives_one_empty_filter() {
    let video = Record { id: Uuid::new_v4(), model: "Video".into(), fields: args(json!({"frames": 10})) };
    assert_eq!(batch_filters(&Arguments::new(), Some(&video)).unwrap(), vec![Arguments::new()]);
    assert_eq!(batch_filters(&args(json!({"frames_batch_size": 5})), None).unwrap(), vec![Arguments::new()]);
    assert!(batch_filters(&args(json!({"frames_batch_size": 0})), Some(&video)).is_err());
  }

  #[test]
  fn created_back_references() {
    let created = vec![Uuid::new_v4(), Uuid::new_v4()];
    assert_eq!(resolve_binding(&json!("__created__1"), &created).unwrap(), created[1]);
    assert!(resolve_binding(&json!("__created__2"), &created).unwrap_err().is_specification());

    let mut arguments = args(json!({"model_id": "__created__0", "name": "__created__x"}));
    resolve_created_refs(&mut arguments, &created).unwrap();
    assert_eq!(arguments["model_id"], json!(created[0].to_string()));
    assert_eq!(arguments["name"], json!("__created__x"));
  }

  #[test]
  fn created_references_resolve_through_nested_children() {
    let created = vec![Uuid::new_v4()];
    let mut nodes: Vec<OperationNode> = serde_json::from_value(json!([{
      "operation": "perform_video_decode",
      "video_id": "__created__0",
      "arguments": {"map": [{
        "operation": "perform_export",
        "video_id": "__created__0",
        "arguments": {"source": "__created__0", "reduce": [{"arguments": {"model": "__created__0"}}]}
      }]}
    }])).unwrap();
    resolve_created_tree(&mut nodes, &created).unwrap();

    let id = json!(created[0].to_string());
    assert_eq!(nodes[0].video_id, Some(id.clone()));
    let export = &nodes[0].arguments.map[0];
    assert_eq!(export.video_id, Some(id.clone()));
    assert_eq!(export.arguments.fields["source"], id);
    assert_eq!(export.arguments.reduce[0].arguments.fields["model"], id);
  }

  #[tokio::test]
  async fn launches_one_task_per_window_with_parent_link() {
    let (engine, store, transport) = engine();
    let video = store
      .create_record("Video", args(json!({"name": "clip.mp4", "frames": 95})))
      .await
      .unwrap();
    let mut parent = Task::new(Uuid::new_v4(), "perform_video_decode", Arguments::new(), "qextract", 1);
    parent.video_id = Some(video);
    store.insert_task(&parent).await.unwrap();

    let node: OperationNode = serde_json::from_value(json!({
      "operation": "perform_dataset_extraction",
      "arguments": {"frames_batch_size": 30, "filters": {"event_id": "__parent_event__"}},
      "task_group_id": 2
    })).unwrap();

    let ids = GraphBuilder::new(&engine).launch(&node, &parent, &[], None, None).await.unwrap();
    assert_eq!(ids.len(), 4);

    let children = store.children_of(parent.id).await.unwrap();
    assert_eq!(children.len(), 4);
    for child in &children {
      assert_eq!(child.parent, Some(parent.id));
      assert_eq!(child.video_id, Some(video));
      assert_eq!(child.task_group_id, 2);
      assert_eq!(child.queue, "qextract");
      assert_eq!(child.arguments["filters"]["event_id"], json!(parent.id.to_string()));
    }
    let sent = transport.sent();
    assert_eq!(sent.len(), 4);
    assert!(sent.iter().all(|m| m.task_ids.len() == 1 && m.operation == "perform_dataset_extraction"));
  }

  #[tokio::test]
  async fn video_selector_overrides_parent_video() {
    let (engine, store, _) = engine();
    let other = store.create_record("Video", args(json!({"name": "other.mp4"}))).await.unwrap();
    let mut parent = Task::new(Uuid::new_v4(), "perform_import", Arguments::new(), "qextract", 1);
    parent.video_id = Some(Uuid::new_v4());

    let node: OperationNode = serde_json::from_value(json!({
      "operation": "perform_video_decode",
      "arguments": {"video_selector": {"name": "other.mp4"}}
    })).unwrap();
    GraphBuilder::new(&engine).launch(&node, &parent, &[], None, None).await.unwrap();
    let children = store.children_of(parent.id).await.unwrap();
    assert_eq!(children[0].video_id, Some(other));

    let missing: OperationNode = serde_json::from_value(json!({
      "operation": "perform_video_decode",
      "arguments": {"video_selector": {"name": "missing.mp4"}}
    })).unwrap();
    let err = GraphBuilder::new(&engine).launch(&missing, &parent, &[], None, None).await.unwrap_err();
    assert!(err.is_specification());
  }
}
