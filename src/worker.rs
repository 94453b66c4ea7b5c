use anyhow::Context;
use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions};
use lapin::types::FieldTable;
use std::env;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use mediaflow::config::Config;
use mediaflow::database::{setup_database, PgStore};
use mediaflow::engine::Engine;
use mediaflow::handlers::HandlerRegistry;
use mediaflow::messaging::{create_rabbit_channel, QueueMessage, RabbitTransport};
use mediaflow::worker_processing::{heartbeat_loop, process_task, register_worker, DispatchOutcome, HEARTBEAT_INTERVAL};
use mediaflow::worker_scheduler::Scheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mediaflow=info")))
    .init();
  let config = Config::from_env()?;
  let queue = env::args()
    .nth(1)
    .or_else(|| env::var("MEDIAFLOW_QUEUE").ok())
    .context("usage: mediaflow_worker <queue> (or set MEDIAFLOW_QUEUE)")?;
  let concurrency: usize = env::var("MEDIAFLOW_CONCURRENCY")
    .ok()
    .and_then(|v| v.parse().ok())
    .unwrap_or(4);

  let db_pool = setup_database(&config.database_url).await?;
  let rabbit_channel = create_rabbit_channel(&config.rabbitmq_url).await?;
  let transport = Arc::new(RabbitTransport::new(rabbit_channel.clone()));
  transport.declare_queue(&queue).await?;

  let engine = Engine::new(Arc::new(PgStore::new(db_pool)), transport, config.engine);
  // Domain handlers are registered here by the deployment that links them in.
  let registry = Arc::new(HandlerRegistry::with_builtins());

  let worker = register_worker(&engine, &queue).await?;
  tokio::spawn(heartbeat_loop(engine.store.clone(), worker.id, HEARTBEAT_INTERVAL));

  let mut consumer = rabbit_channel
    .basic_consume(&queue, &format!("mediaflow-{}", worker.id), BasicConsumeOptions::default(), FieldTable::default())
    .await
    .context("failed to start consumer")?;
  info!("worker {} consuming {} with {} slots", worker.id, queue, concurrency);

  let scheduler = Arc::new(Scheduler::new());
  let semaphore = Arc::new(Semaphore::new(concurrency));

  let scheduler_consumer = scheduler.clone();
  tokio::spawn(async move {
    while let Some(delivery) = consumer.next().await {
      match delivery {
        Ok(delivery) => match serde_json::from_slice::<QueueMessage>(&delivery.data) {
          Ok(message) => scheduler_consumer.add_task(message.priority, (delivery, message)).await,
          Err(e) => {
            error!("Failed to parse message: {:?}", e);
            let _ = delivery.ack(BasicAckOptions::default()).await;
          }
        },
        Err(e) => error!("Consumer error: {:?}", e),
      }
    }
  });

  loop {
    let Some((delivery, message)) = scheduler.get_next().await else {
      tokio::time::sleep(Duration::from_millis(100)).await;
      continue;
    };
    let permit = semaphore.clone().acquire_owned().await?;
    let engine = engine.clone();
    let registry = registry.clone();
    let worker_id = worker.id;
    tokio::spawn(async move {
      let execution_id = format!("{}:{}", worker_id, delivery.delivery_tag);
      for task_id in &message.task_ids {
        match process_task(&engine, &registry, *task_id, Some(worker_id), &execution_id).await {
          Ok(DispatchOutcome::Ran(launched)) => info!("{} {} launched {} tasks", message.operation, task_id, launched.len()),
          Ok(DispatchOutcome::Skipped) => debug!("{} {} skipped", message.operation, task_id),
          Ok(DispatchOutcome::Failed { restarted }) => error!("{} {} failed, restarted as {:?}", message.operation, task_id, restarted),
          Err(e) => error!("Processing failed for task {}: {:?}", task_id, e),
        }
      }
      // Outcomes live in the store; redelivery is driven by restarts, not nacks.
      let _ = delivery.ack(BasicAckOptions::default()).await;
      drop(permit);
    });
  }
}
