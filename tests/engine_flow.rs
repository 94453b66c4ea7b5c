use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

use mediaflow::config::EngineSettings;
use mediaflow::continuation::{ContinuationEngine, NextOptions};
use mediaflow::engine::Engine;
use mediaflow::error::{EngineError, EngineResult};
use mediaflow::handlers::{HandlerRegistry, OperationHandler};
use mediaflow::memory_store::MemoryStore;
use mediaflow::messaging::MemoryTransport;
use mediaflow::models::{Task, LAUNCH_OPERATION};
use mediaflow::monitor::{NullRuntime, ProcessMonitor};
use mediaflow::process::ProcessLauncher;
use mediaflow::store::Store;
use mediaflow::waiter::{BarrierState, Waiter};
use mediaflow::worker_processing::{process_task, DispatchOutcome};

/// Stands in for a domain operation: expands continuations, then completes.
struct Passthrough {
  runs: AtomicUsize,
}

#[async_trait]
impl OperationHandler for Passthrough {
  async fn handle(&self, engine: &Engine, task: Task) -> EngineResult<Vec<Uuid>> {
    self.runs.fetch_add(1, Ordering::SeqCst);
    tokio::task::yield_now().await;
    let launched = ContinuationEngine::new(engine).process_next(&task, NextOptions::default()).await?;
    engine.complete_task(task.id, None).await?;
    Ok(launched)
  }
}

struct AlwaysFails;

#[async_trait]
impl OperationHandler for AlwaysFails {
  async fn handle(&self, _engine: &Engine, _task: Task) -> EngineResult<Vec<Uuid>> {
    Err(EngineError::Handler("CUDA out of memory".into()))
  }
}

fn setup(settings: EngineSettings) -> (Engine, Arc<MemoryStore>, Arc<MemoryTransport>) {
  let store = Arc::new(MemoryStore::new());
  let transport = Arc::new(MemoryTransport::new());
  let engine = Engine::new(store.clone(), transport.clone(), settings);
  (engine, store, transport)
}

fn registry(passthrough: Arc<Passthrough>, operations: &[&str]) -> HandlerRegistry {
  let mut registry = HandlerRegistry::with_builtins();
  for operation in operations {
    registry.register(*operation, passthrough.clone());
  }
  registry
}

async fn submit(engine: &Engine, specification: Value) -> ProcessLauncher {
  let mut launcher = ProcessLauncher::create_from_spec(engine.clone(), serde_json::from_value(specification).unwrap())
    .await
    .unwrap();
  assert_ok!(launcher.launch().await);
  launcher
}

/// Delivers every sent message, delayed ones included, until the queues are quiet.
async fn run_until_idle(engine: &Engine, transport: &MemoryTransport, registry: &HandlerRegistry) -> usize {
  let mut rounds = 0;
  loop {
    let batch = transport.drain();
    if batch.is_empty() {
      return rounds;
    }
    rounds += 1;
    assert!(rounds < 50, "queues never went idle");
    for message in batch {
      for id in message.task_ids {
        assert_ok!(process_task(engine, registry, id, None, &format!("exec-{rounds}-{id}")).await);
      }
    }
  }
}

fn two_level_spec() -> Value {
  json!({
    "process_type": "process",
    "map": [{
      "operation": "perform_video_decode",
      "arguments": {
        "map": [{"operation": "perform_dataset_extraction", "arguments": {"filters": {"event_id": "__parent_event__"}}}],
        "reduce": [{"arguments": {"reduce_target": "root"}}]
      }
    }]
  })
}

#[tokio::test]
async fn reduce_waits_for_generating_task_before_process_completes() {
  let (engine, store, transport) = setup(EngineSettings::default());
  let launcher = submit(&engine, two_level_spec()).await;
  let process_id = launcher.process().id;
  let passthrough = Arc::new(Passthrough { runs: AtomicUsize::new(0) });
  let registry = registry(passthrough, &["perform_dataset_extraction"]);
  let monitor = ProcessMonitor::new(engine.clone(), Arc::new(NullRuntime));

  let sent = transport.drain();
  assert_eq!(sent.len(), 1);
  let a_id = sent[0].task_ids[0];

  // A is mid-handler: it has expanded its continuations but not finished.
  assert!(store.try_start_task(a_id, None, Some("a")).await.unwrap());
  let a = store.get_task(a_id).await.unwrap();
  let launched = ContinuationEngine::new(&engine).process_next(&a, NextOptions::default()).await.unwrap();
  assert_eq!(launched.len(), 2);
  transport.drain();

  let children = store.children_of(a_id).await.unwrap();
  let b = children.iter().find(|t| !t.is_reduce()).unwrap().clone();
  let c = children.iter().find(|t| t.is_reduce()).unwrap().clone();
  assert_eq!(b.arguments["filters"]["event_id"], json!(a_id.to_string()));

  let process = store.get_process(process_id).await.unwrap();
  let state = Waiter::new(&*store, &c).unwrap().evaluate(&process).await.unwrap();
  assert_eq!(state, BarrierState::Pending { waiting_on: a_id });

  assert_eq!(process_task(&engine, &registry, b.id, None, "b").await.unwrap(), DispatchOutcome::Ran(vec![]));
  assert_eq!(process_task(&engine, &registry, c.id, None, "c-1").await.unwrap(), DispatchOutcome::Ran(vec![]));
  let resent = transport.drain();
  assert_eq!(resent.len(), 1);
  assert_eq!(resent[0].task_ids, vec![c.id]);
  assert_eq!(resent[0].delay, Some(engine.settings.reducer_timeout));
  assert!(!store.get_task(c.id).await.unwrap().completed);
  assert!(!monitor.sweep_process(&process).await.unwrap().completed);

  engine.complete_task(a_id, None).await.unwrap();
  assert_eq!(process_task(&engine, &registry, c.id, None, "c-2").await.unwrap(), DispatchOutcome::Ran(vec![]));
  assert!(store.get_task(c.id).await.unwrap().completed);

  assert!(monitor.sweep_process(&process).await.unwrap().completed);
  let done = store.get_process(process_id).await.unwrap();
  assert!(done.completed);
  assert!(!done.failed);
}

#[tokio::test]
async fn batched_forest_drains_and_parents_form_a_tree() {
  let (engine, store, transport) = setup(EngineSettings::default());
  store
    .create_record("Video", serde_json::from_value(json!({"name": "match.mp4", "frames": 95})).unwrap())
    .await
    .unwrap();
  let launcher = submit(&engine, json!({
    "process_type": "process",
    "map": [{
      "operation": "perform_video_decode",
      "arguments": {
        "video_selector": {"name": "match.mp4"},
        "map": [{
          "operation": "perform_dataset_extraction",
          "arguments": {
            "frames_batch_size": 30,
            "task_group_name": "extract",
            "map": [{"operation": "perform_transformation", "arguments": {"filters": "__parent__"}}]
          }
        }],
        "reduce": [{"arguments": {"reduce_target": "all"}}]
      }
    }],
    "reduce": [{"arguments": {"reduce_target": "filter", "reduce_filter": ["extract"]}}]
  }))
  .await;
  let passthrough = Arc::new(Passthrough { runs: AtomicUsize::new(0) });
  let registry = registry(
    passthrough.clone(),
    &["perform_video_decode", "perform_dataset_extraction", "perform_transformation"],
  );

  run_until_idle(&engine, &transport, &registry).await;
  // decode, four extraction windows, four transformations
  assert_eq!(passthrough.runs.load(Ordering::SeqCst), 9);

  let tasks = store.tasks_for_process(launcher.process().id).await.unwrap();
  assert!(tasks.iter().all(Task::is_terminal));
  let windows: Vec<&Task> = tasks.iter().filter(|t| t.operation == "perform_dataset_extraction").collect();
  assert_eq!(windows.len(), 4);
  assert_eq!(windows.iter().filter(|t| t.arguments["filters"].get("frame_index__lt").is_none()).count(), 1);
  for transform in tasks.iter().filter(|t| t.operation == "perform_transformation") {
    let parent = tasks.iter().find(|t| Some(t.id) == transform.parent).unwrap();
    assert_eq!(transform.arguments["filters"], parent.arguments["filters"]);
  }

  let by_id: HashMap<Uuid, &Task> = tasks.iter().map(|t| (t.id, t)).collect();
  for task in &tasks {
    let mut steps = 0;
    let mut current: &Task = task;
    while let Some(parent) = current.parent {
      current = by_id[&parent];
      steps += 1;
      assert!(steps <= 4, "parent chain too deep from {}", task.id);
    }
    assert_eq!(current.operation, LAUNCH_OPERATION);
  }

  let monitor = ProcessMonitor::new(engine.clone(), Arc::new(NullRuntime));
  monitor.sweep_all().await.unwrap();
  let process = store.get_process(launcher.process().id).await.unwrap();
  assert!(process.completed && !process.failed);
  assert_eq!(process.specification.task_group_name_to_index["extract"], 2);
}

#[tokio::test]
async fn repeated_failures_stop_at_the_attempt_budget() {
  let settings = EngineSettings { max_task_attempts: 2, ..EngineSettings::default() };
  let (engine, store, transport) = setup(settings);
  let launcher = submit(&engine, json!({
    "process_type": "process",
    "map": [{"operation": "perform_detection", "arguments": {"queue": "qgpu"}}]
  }))
  .await;
  let mut registry = HandlerRegistry::with_builtins();
  registry.register("perform_detection", Arc::new(AlwaysFails));

  assert_eq!(run_until_idle(&engine, &transport, &registry).await, 3);

  let process_id = launcher.process().id;
  let restarts = store.restarts_for_process(process_id).await.unwrap();
  assert_eq!(restarts.len(), 2);
  let detections: Vec<Task> = store
    .tasks_for_process(process_id)
    .await
    .unwrap()
    .into_iter()
    .filter(|t| t.operation == "perform_detection")
    .collect();
  assert_eq!(detections.len(), 1);
  assert!(detections[0].errored);
  assert_eq!(detections[0].error_message.as_deref(), Some("handler failed: CUDA out of memory"));

  ProcessMonitor::new(engine.clone(), Arc::new(NullRuntime)).sweep_all().await.unwrap();
  let process = store.get_process(process_id).await.unwrap();
  assert!(process.completed);
  assert!(process.failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_consumers_execute_a_task_once() {
  let (engine, store, transport) = setup(EngineSettings::default());
  submit(&engine, json!({"process_type": "process", "map": [{"operation": "perform_export"}]})).await;
  let task_id = transport.drain()[0].task_ids[0];
  let passthrough = Arc::new(Passthrough { runs: AtomicUsize::new(0) });
  let registry = Arc::new(registry(passthrough.clone(), &["perform_export"]));

  let handles: Vec<_> = (0..8)
    .map(|n| {
      let engine = engine.clone();
      let registry = registry.clone();
      tokio::spawn(async move { process_task(&engine, &registry, task_id, None, &format!("delivery-{n}")).await })
    })
    .collect();
  for handle in handles {
    assert_ok!(handle.await.unwrap());
  }
  assert_eq!(passthrough.runs.load(Ordering::SeqCst), 1);
  assert!(store.get_task(task_id).await.unwrap().completed);
}

#[tokio::test]
async fn query_processes_wait_on_their_direct_tasks() {
  let (engine, store, transport) = setup(EngineSettings::default());
  store
    .create_record("Retriever", serde_json::from_value(json!({"name": "exact"})).unwrap())
    .await
    .unwrap();
  let launcher = submit(&engine, json!({
    "process_type": "query",
    "map": [{"operation": "perform_retrieval", "arguments": {"retriever_selector": {"name": "exact"}}}]
  }))
  .await;
  assert_err!(launcher.wait_query(std::time::Duration::from_millis(20)).await);

  let passthrough = Arc::new(Passthrough { runs: AtomicUsize::new(0) });
  run_until_idle(&engine, &transport, &registry(passthrough, &["perform_retrieval"])).await;
  assert_ok!(launcher.wait_query(std::time::Duration::from_secs(1)).await);
}
