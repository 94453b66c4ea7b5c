//! Process creation and launch.
//!
//! A `process` runs its `delete` and `create` entries synchronously, then
//! hangs its task forest off a completed `perform_launch` root task. A
//! `query` launches its top-level nodes directly under the process and is
//! waited on by the caller.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};
use uuid::Uuid;

use crate::builder::{resolve_binding, resolve_created_refs, resolve_created_tree, GraphBuilder};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::groups::TaskGroupAssigner;
use crate::models::{Process, ProcessType, Task, CREATE_OPERATION, LAUNCH_OPERATION, REDUCE_OPERATION, SYNC_QUEUE};
use crate::specification::{OperationNode, ProcessSpecification};

pub const NOW_TOKEN: &str = "__timezone.now__";
const QUERY_POLL: Duration = Duration::from_millis(500);

pub struct ProcessLauncher {
  engine: Engine,
  process: Process,
  created: Vec<Uuid>,
  submitted: Vec<Uuid>,
}

impl ProcessLauncher {
  /// Stores a new process. For queries the inline base64 payload is decoded,
  /// stored separately and cleared from the specification.
  pub async fn create_from_spec(engine: Engine, mut specification: ProcessSpecification) -> EngineResult<Self> {
    let encoded = specification.image_data_b64.take();
    let payload = match (specification.process_type, encoded) {
      (ProcessType::Query, Some(data)) if !data.trim().is_empty() => Some(
        STANDARD
          .decode(data.trim())
          .map_err(|e| EngineError::spec(format!("image_data_b64 is not valid base64: {e}")))?,
      ),
      _ => None,
    };
    let process = Process::new(specification);
    engine.store.insert_process(&process).await?;
    if let Some(data) = payload {
      engine.store.store_query_payload(process.id, &data).await?;
    }
    info!("created {} process {}", process.process_type, process.id);
    Ok(Self { engine, process, created: Vec::new(), submitted: Vec::new() })
  }

  pub fn process(&self) -> &Process {
    &self.process
  }

  pub fn submitted(&self) -> &[Uuid] {
    &self.submitted
  }

  pub async fn launch(&mut self) -> EngineResult<()> {
    let result = match self.process.process_type {
      ProcessType::Process => self.launch_processing().await,
      ProcessType::Query => self.launch_query().await,
      ProcessType::Schedule => Err(EngineError::spec("schedule processes cannot be launched directly")),
    };
    match result {
      Ok(()) => {
        info!("launched process {} with {} tasks", self.process.id, self.submitted.len());
        Ok(())
      }
      Err(e) if e.is_specification() => {
        warn!("process {} failed to launch: {}", self.process.id, e);
        self.process.fail(e.to_string());
        self.engine.store.update_specification(self.process.id, &self.process.specification).await?;
        self.engine.store.fail_process(self.process.id, &e.to_string()).await?;
        Err(e)
      }
      Err(e) => Err(e),
    }
  }

  async fn launch_processing(&mut self) -> EngineResult<()> {
    let mut assigner = TaskGroupAssigner::new();
    self.delete_records().await?;
    let root = self.create_root_task(&mut assigner).await?;
    self.create_records(&root, &mut assigner).await?;

    let specification = &mut self.process.specification;
    let mut map = std::mem::take(&mut specification.map);
    let mut reduce = std::mem::take(&mut specification.reduce);
    let resolved = resolve_created_tree(&mut map, &self.created).and_then(|()| resolve_created_tree(&mut reduce, &self.created));
    assigner.assign(&mut map, Some(root.task_group_id));
    assigner.assign(&mut reduce, Some(root.task_group_id));
    let invalid = reduce.iter().find_map(|node| node.operation.clone());
    if invalid.is_none() {
      for node in reduce.iter_mut() {
        node.operation = Some(REDUCE_OPERATION.to_string());
      }
    }
    specification.map = map;
    specification.reduce = reduce;
    resolved?;
    if let Some(operation) = invalid {
      return Err(EngineError::spec(format!(
        "{operation} is not a valid reduce operation, reduce tasks should not have an operation"
      )));
    }
    assigner.record_into(specification);
    if !assigner.errors().is_empty() {
      return Err(EngineError::spec(assigner.errors().join(" ")));
    }
    // Reduce tasks read the group maps back from the store.
    self.engine.store.update_specification(self.process.id, specification).await?;

    let nodes: Vec<OperationNode> = specification.map.iter().chain(specification.reduce.iter()).cloned().collect();
    let builder = GraphBuilder::new(&self.engine);
    for node in &nodes {
      let ids = builder.launch(node, &root, &self.created, None, None).await?;
      self.submitted.extend(ids);
    }
    Ok(())
  }

  async fn launch_query(&mut self) -> EngineResult<()> {
    let mut assigner = TaskGroupAssigner::new();
    let specification = &mut self.process.specification;
    assigner.assign(&mut specification.map, None);
    assigner.record_into(specification);
    if !assigner.errors().is_empty() {
      return Err(EngineError::spec(assigner.errors().join(" ")));
    }
    self.engine.store.update_specification(self.process.id, specification).await?;
    let nodes = specification.map.clone();
    let builder = GraphBuilder::new(&self.engine);
    for node in &nodes {
      let id = builder.launch_detached(node, self.process.id).await?;
      self.submitted.push(id);
    }
    Ok(())
  }

  /// Only videos can be deleted; other models flag the process without
  /// stopping the launch.
  async fn delete_records(&mut self) -> EngineResult<()> {
    for entry in self.process.specification.delete.clone() {
      if entry.model != "Video" {
        let message = format!("Cannot delete {}; only video deletion is implemented.", entry.model);
        self.engine.store.fail_process(self.process.id, &message).await?;
        self.process.fail(message);
        continue;
      }
      match self.engine.store.delete_record(&entry.model, &entry.selector).await? {
        Some(id) => info!("deleted video {} for process {}", id, self.process.id),
        None => {
          return Err(EngineError::spec(format!(
            "no video matches delete selector {}",
            Value::Object(entry.selector.clone())
          )));
        }
      }
    }
    Ok(())
  }

  async fn create_root_task(&self, assigner: &mut TaskGroupAssigner) -> EngineResult<Task> {
    let mut root = Task::new(self.process.id, LAUNCH_OPERATION, Default::default(), SYNC_QUEUE, assigner.reserve());
    root.started = true;
    root.completed = true;
    root.start_ts = Some(Utc::now());
    root.duration = Some(0.0);
    self.engine.store.insert_task(&root).await?;
    Ok(root)
  }

  /// Records bound to a video get one synthetic `perform_create` event per video.
  async fn create_records(&mut self, root: &Task, assigner: &mut TaskGroupAssigner) -> EngineResult<()> {
    let mut video_events: HashMap<Uuid, Uuid> = HashMap::new();
    for entry in self.process.specification.create.clone() {
      let mut fields = entry.spec.clone();
      let now = Value::String(Utc::now().to_rfc3339());
      for value in fields.values_mut() {
        if value.as_str() == Some(NOW_TOKEN) {
          *value = now.clone();
        }
      }
      resolve_created_refs(&mut fields, &self.created)?;

      if entry.model != "Video" && entry.model != "TrainingSet" {
        let event = match fields.get("video_id") {
          Some(binding) => {
            let video = resolve_binding(binding, &self.created)?;
            match video_events.get(&video) {
              Some(event) => *event,
              None => {
                let event = self.create_video_event(root, video, assigner.reserve()).await?;
                video_events.insert(video, event);
                event
              }
            }
          }
          None => root.id,
        };
        fields.insert("event_id".into(), Value::String(event.to_string()));
      }
      let id = self.engine.store.create_record(&entry.model, fields).await?;
      self.created.push(id);
    }
    for event in video_events.values() {
      self.engine.complete_task(*event, None).await?;
    }
    Ok(())
  }

  async fn create_video_event(&self, root: &Task, video: Uuid, group: i64) -> EngineResult<Uuid> {
    let mut event = Task::new(self.process.id, CREATE_OPERATION, Default::default(), SYNC_QUEUE, group).with_parent(root);
    event.started = true;
    event.start_ts = Some(Utc::now());
    event.video_id = Some(video);
    self.engine.store.insert_task(&event).await?;
    Ok(event.id)
  }

  /// Blocks until every task of a query process is terminal.
  pub async fn wait_query(&self, timeout: Duration) -> EngineResult<()> {
    if self.process.process_type != ProcessType::Query {
      return Err(EngineError::spec("wait_query is only supported by query processes"));
    }
    let deadline = Instant::now() + timeout;
    loop {
      let tasks = self.engine.store.tasks_for_process(self.process.id).await?;
      if tasks.iter().all(Task::is_terminal) {
        return Ok(());
      }
      if Instant::now() >= deadline {
        let pending = tasks.iter().filter(|t| !t.is_terminal()).count();
        return Err(EngineError::Timeout(format!("query {} ({pending} tasks pending)", self.process.id)));
      }
      sleep(QUERY_POLL).await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::continuation::{ContinuationEngine, NextOptions};
  use crate::memory_store::MemoryStore;
  use crate::messaging::{MemoryTransport, QueueTransport};
  use crate::store::Store;
  use async_trait::async_trait;
  use crate::test_support::{args, engine};
  use serde_json::json;
  use std::sync::Arc;

  fn spec(value: Value) -> ProcessSpecification {
    serde_json::from_value(value).unwrap()
  }

  async fn launched(engine: &Engine, value: Value) -> (ProcessLauncher, EngineResult<()>) {
    let mut launcher = ProcessLauncher::create_from_spec(engine.clone(), spec(value)).await.unwrap();
    let result = launcher.launch().await;
    (launcher, result)
  }

  #[tokio::test]
  async fn process_builds_root_creates_and_map_tasks() {
    let (engine, store, _) = engine();
    let (launcher, result) = launched(&engine, json!({
      "process_type": "process",
      "create": [
        {"MODEL": "Video", "spec": {"name": "clip.mp4", "frames": 60, "created": "__timezone.now__"}},
        {"MODEL": "Label", "spec": {"name": "car", "video_id": "__created__0"}},
        {"MODEL": "Label", "spec": {"name": "bus", "video_id": "__created__0"}},
        {"MODEL": "Label", "spec": {"name": "global"}}
      ],
      "map": [{
        "operation": "perform_video_decode",
        "video_id": "__created__0",
        "arguments": {"frames_batch_size": 30, "task_group_name": "decode"}
      }],
      "reduce": [{"arguments": {"reduce_target": "root"}}]
    })).await;
    result.unwrap();

    let process = store.get_process(launcher.process().id).await.unwrap();
    assert!(!process.failed);
    assert!(process.specification.task_group_name_to_index.contains_key("decode"));
    assert_eq!(process.specification.reduce[0].operation.as_deref(), Some(REDUCE_OPERATION));

    let tasks = store.tasks_for_process(process.id).await.unwrap();
    let root = tasks.iter().find(|t| t.operation == LAUNCH_OPERATION).unwrap();
    assert!(root.completed && root.parent.is_none() && root.task_group_id == 0);

    let events: Vec<&Task> = tasks.iter().filter(|t| t.operation == CREATE_OPERATION).collect();
    assert_eq!(events.len(), 1);
    assert!(events[0].completed);
    assert_eq!(events[0].task_group_id, 1);

    let video = store.find_record("Video", &args(json!({"name": "clip.mp4"}))).await.unwrap().unwrap();
    assert_ne!(video.fields["created"], json!(NOW_TOKEN));
    let car = store.find_record("Label", &args(json!({"name": "car"}))).await.unwrap().unwrap();
    assert_eq!(car.fields["event_id"], json!(events[0].id.to_string()));
    let global = store.find_record("Label", &args(json!({"name": "global"}))).await.unwrap().unwrap();
    assert_eq!(global.fields["event_id"], json!(root.id.to_string()));

    let decodes: Vec<&Task> = tasks.iter().filter(|t| t.operation == "perform_video_decode").collect();
    assert_eq!(decodes.len(), 2);
    assert!(decodes.iter().all(|t| t.parent == Some(root.id) && t.video_id == Some(video.id)));
    let reduce = tasks.iter().find(|t| t.is_reduce()).unwrap();
    assert_eq!(reduce.queue, "qreducer");
    assert_eq!(reduce.parent, Some(root.id));
    assert_eq!(launcher.submitted().len(), 3);
  }

  #[tokio::test]
  async fn nested_continuations_keep_created_bindings() {
    let (engine, store, _) = engine();
    let (launcher, result) = launched(&engine, json!({
      "process_type": "process",
      "create": [{"MODEL": "Video", "spec": {"name": "clip.mp4"}}],
      "map": [{
        "operation": "perform_video_decode",
        "video_id": "__created__0",
        "arguments": {"map": [{
          "operation": "perform_export",
          "video_id": "__created__0",
          "arguments": {"source": "__created__0"}
        }]}
      }]
    })).await;
    result.unwrap();

    let video = store.find_record("Video", &args(json!({"name": "clip.mp4"}))).await.unwrap().unwrap();
    let decode = store.get_task(launcher.submitted()[0]).await.unwrap();
    let launched = ContinuationEngine::new(&engine).process_next(&decode, NextOptions::default()).await.unwrap();
    let export = store.get_task(launched[0]).await.unwrap();
    assert_eq!(export.video_id, Some(video.id));
    assert_eq!(export.arguments["source"], json!(video.id.to_string()));
  }

  struct FailingWorker {
    store: Arc<MemoryStore>,
    inner: MemoryTransport,
  }

  #[async_trait]
  impl QueueTransport for FailingWorker {
    async fn send(&self, operation: &str, task_ids: &[Uuid], queue: &str, delay: Option<Duration>) -> EngineResult<()> {
      for id in task_ids {
        let task = self.store.get_task(*id).await?;
        self.store.fail_process(task.parent_process, "decoder rejected the file").await?;
      }
      self.inner.send(operation, task_ids, queue, delay).await
    }
  }

  #[tokio::test]
  async fn launch_keeps_failures_recorded_while_tasks_were_sent() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(FailingWorker { store: store.clone(), inner: MemoryTransport::new() });
    let engine = Engine::new(store.clone(), transport, Default::default());
    let (launcher, result) = launched(&engine, json!({
      "process_type": "process",
      "map": [{"operation": "perform_import", "arguments": {"task_group_name": "import"}}]
    })).await;
    result.unwrap();

    let process = store.get_process(launcher.process().id).await.unwrap();
    assert!(process.failed);
    assert_eq!(process.error_message.as_deref(), Some("decoder rejected the file"));
    assert!(process.specification.task_group_name_to_index.contains_key("import"));
  }

  #[tokio::test]
  async fn duplicate_group_names_fail_before_any_work_is_launched() {
    let (engine, store, transport) = engine();
    let (launcher, result) = launched(&engine, json!({
      "process_type": "process",
      "map": [
        {"operation": "perform_video_decode", "arguments": {"task_group_name": "x"}},
        {"operation": "perform_transformation", "arguments": {"task_group_name": "x"}}
      ]
    })).await;
    assert!(result.unwrap_err().is_specification());
    let process = store.get_process(launcher.process().id).await.unwrap();
    assert!(process.failed);
    assert!(process.error_message.unwrap().contains("Repeated task group name"));
    assert!(transport.sent().is_empty());
  }

  #[tokio::test]
  async fn reduce_with_operation_and_schedule_are_rejected() {
    let (engine, store, _) = engine();
    let (launcher, result) = launched(&engine, json!({
      "process_type": "process",
      "reduce": [{"operation": "perform_export", "arguments": {}}]
    })).await;
    assert!(result.unwrap_err().is_specification());
    assert!(store.get_process(launcher.process().id).await.unwrap().failed);

    let (launcher, result) = launched(&engine, json!({"process_type": "schedule"})).await;
    assert!(result.is_err());
    assert!(store.get_process(launcher.process().id).await.unwrap().failed);
  }

  #[tokio::test]
  async fn only_video_deletion_is_supported() {
    let (engine, store, _) = engine();
    let video = store.create_record("Video", args(json!({"name": "old.mp4"}))).await.unwrap();
    let (launcher, result) = launched(&engine, json!({
      "process_type": "process",
      "delete": [
        {"MODEL": "Video", "selector": {"name": "old.mp4"}},
        {"MODEL": "Region", "selector": {"id": Uuid::new_v4().to_string()}}
      ]
    })).await;
    result.unwrap();
    assert!(store.get_record(video).await.unwrap().is_none());
    let process = store.get_process(launcher.process().id).await.unwrap();
    assert!(process.failed);
    assert!(process.error_message.unwrap().contains("Region"));
  }

  #[tokio::test]
  async fn query_stores_payload_and_waits_for_its_forest() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(MemoryTransport::new());
    let engine = Engine::new(store.clone(), transport.clone(), Default::default());
    store.create_record("Retriever", args(json!({"name": "exact"}))).await.unwrap();

    let (launcher, result) = launched(&engine, json!({
      "process_type": "query",
      "image_data_b64": STANDARD.encode(b"png-bytes"),
      "map": [{"operation": "perform_retrieval", "arguments": {"retriever_selector": {"name": "exact"}, "count": 5}}]
    })).await;
    result.unwrap();
    let id = launcher.process().id;
    assert_eq!(store.query_payload(id), Some(b"png-bytes".to_vec()));
    assert!(store.get_process(id).await.unwrap().specification.image_data_b64.is_none());

    let direct = launcher.submitted()[0];
    let task = store.get_task(direct).await.unwrap();
    assert!(task.parent.is_none());
    assert_eq!(task.queue, "qglobal_retriever");

    let err = launcher.wait_query(Duration::from_millis(10)).await.unwrap_err();
    assert!(matches!(err, EngineError::Timeout(_)));

    let child = Task::new(id, "perform_indexing", Default::default(), "q", 2).with_parent(&task);
    store.insert_task(&child).await.unwrap();
    store.complete_task(direct, None).await.unwrap();
    assert!(launcher.wait_query(Duration::from_millis(10)).await.is_err());
    store.complete_task(child.id, None).await.unwrap();
    launcher.wait_query(Duration::from_secs(1)).await.unwrap();
  }
}
