use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;
pub const DEFAULT_PRIORITY: u8 = 5;

pub async fn create_rabbit_channel(rabbitmq_url: &str) -> anyhow::Result<Channel> {
  let conn = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
    Connection::connect(rabbitmq_url, ConnectionProperties::default())
  })
    .await?;
  let channel = conn.create_channel().await?;
  info!("RabbitMQ channel created");
  Ok(channel)
}

pub async fn publish_message(channel: &Channel, queue: &str, payload: &[u8], priority: u8) -> EngineResult<()> {
  Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || async {
    channel
      .basic_publish(
        "",
        queue,
        BasicPublishOptions::default(),
        payload,
        BasicProperties::default().with_priority(priority),
      )
      .await
  })
    .await?;
  Ok(())
}

/// Wire format of every queue message: the operation and the ids it applies to.
/// Handlers rehydrate everything else from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
  pub operation: String,
  pub task_ids: Vec<Uuid>,
  #[serde(default = "default_priority")]
  pub priority: u8,
}

fn default_priority() -> u8 {
  DEFAULT_PRIORITY
}

#[async_trait]
pub trait QueueTransport: Send + Sync {
  async fn send(&self, operation: &str, task_ids: &[Uuid], queue: &str, delay: Option<Duration>) -> EngineResult<()>;
}

pub struct RabbitTransport {
  channel: Channel,
  declared: AsyncMutex<HashSet<String>>,
}

impl RabbitTransport {
  pub fn new(channel: Channel) -> Self {
    Self { channel, declared: AsyncMutex::new(HashSet::new()) }
  }

  pub async fn declare_queue(&self, queue: &str) -> EngineResult<()> {
    self.declare(queue, FieldTable::default()).await
  }

  async fn declare(&self, queue: &str, arguments: FieldTable) -> EngineResult<()> {
    let mut declared = self.declared.lock().await;
    if declared.contains(queue) {
      return Ok(());
    }
    self.channel
      .queue_declare(queue, QueueDeclareOptions { durable: true, ..Default::default() }, arguments)
      .await?;
    declared.insert(queue.to_string());
    Ok(())
  }

  /// Messages parked here expire after `delay` and are dead-lettered back onto `queue`.
  async fn holding_queue(&self, queue: &str, delay: Duration) -> EngineResult<String> {
    let millis = delay.as_millis().max(1) as i64;
    let name = format!("{queue}.delay.{millis}");
    let mut arguments = FieldTable::default();
    arguments.insert("x-message-ttl".into(), AMQPValue::LongLongInt(millis));
    arguments.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
    arguments.insert("x-dead-letter-routing-key".into(), AMQPValue::LongString(queue.into()));
    self.declare(&name, arguments).await?;
    Ok(name)
  }
}

#[async_trait]
impl QueueTransport for RabbitTransport {
  async fn send(&self, operation: &str, task_ids: &[Uuid], queue: &str, delay: Option<Duration>) -> EngineResult<()> {
    let message = QueueMessage {
      operation: operation.to_string(),
      task_ids: task_ids.to_vec(),
      priority: DEFAULT_PRIORITY,
    };
    let payload = serde_json::to_vec(&message)?;
    self.declare_queue(queue).await?;
    let target = match delay {
      Some(delay) if !delay.is_zero() => self.holding_queue(queue, delay).await?,
      _ => queue.to_string(),
    };
    publish_message(&self.channel, &target, &payload, message.priority).await?;
    debug!("sent {} {:?} to {}", operation, task_ids, target);
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
  pub operation: String,
  pub task_ids: Vec<Uuid>,
  pub queue: String,
  pub delay: Option<Duration>,
}

/// Records sends instead of delivering them.
#[derive(Default)]
pub struct MemoryTransport {
  sent: Mutex<Vec<SentMessage>>,
}

impl MemoryTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn sent(&self) -> Vec<SentMessage> {
    self.sent.lock().map(|s| s.clone()).unwrap_or_default()
  }

  /// Removes and returns everything sent so far.
  pub fn drain(&self) -> Vec<SentMessage> {
    self.sent.lock().map(|mut s| std::mem::take(&mut *s)).unwrap_or_default()
  }
}

#[async_trait]
impl QueueTransport for MemoryTransport {
  async fn send(&self, operation: &str, task_ids: &[Uuid], queue: &str, delay: Option<Duration>) -> EngineResult<()> {
    let mut sent = self.sent.lock().map_err(|_| EngineError::Storage("transport log poisoned".into()))?;
    sent.push(SentMessage {
      operation: operation.to_string(),
      task_ids: task_ids.to_vec(),
      queue: queue.to_string(),
      delay,
    });
    Ok(())
  }
}
