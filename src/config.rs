use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  pub rabbitmq_url: String,
  pub server_port: u16,
  pub engine: EngineSettings,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Ok(Self {
      database_url: env::var("DATABASE_URL").context("DATABASE_URL is not set")?,
      rabbitmq_url: env::var("RABBITMQ_URL").context("RABBITMQ_URL is not set")?,
      server_port: env::var("SERVER_PORT")
        .unwrap_or_else(|_| "8080".into())
        .parse()
        .unwrap_or(8080),
      engine: EngineSettings::from_env()?,
    })
  }
}

/// Routing, retry and liveness knobs shared by every component.
#[derive(Debug, Clone)]
pub struct EngineSettings {
  pub extractor_queue: String,
  pub reducer_queue: String,
  pub streamer_queue: String,
  pub manager_queue: String,
  pub global_model_queue: String,
  pub global_retriever_queue: String,
  pub global_model_enabled: bool,
  pub global_retriever_enabled: bool,
  /// Operations bound to a fixed system queue.
  pub operation_queues: HashMap<String, String>,
  pub restartable_operations: HashSet<String>,
  /// Operations that never bind to a video.
  pub non_processing_operations: HashSet<String>,
  pub max_task_attempts: u32,
  pub reducer_timeout: Duration,
  pub heartbeat_timeout: Duration,
  pub queue_refresh_interval: Duration,
  /// Workers are scheduled by the host (e.g. kubernetes) rather than relaunched locally.
  pub kube_mode: bool,
  pub media_bucket: Option<String>,
  pub cloud_fs_enabled: bool,
}

const EXTRACTOR_OPERATIONS: &[&str] = &[
  "perform_import",
  "perform_video_segmentation",
  "perform_video_decode",
  "perform_frame_download",
  "perform_dataset_extraction",
  "perform_transformation",
  "perform_deletion",
  "perform_export",
  "perform_model_import",
  "perform_region_import",
  "perform_training_set_creation",
  "perform_compression",
  "perform_decompression",
  "perform_sync",
];

impl Default for EngineSettings {
  fn default() -> Self {
    let extractor_queue = "qextract".to_string();
    let reducer_queue = "qreducer".to_string();
    let streamer_queue = "qstreamer".to_string();
    let manager_queue = "qmanager".to_string();

    let mut operation_queues: HashMap<String, String> = EXTRACTOR_OPERATIONS
      .iter()
      .map(|op| (op.to_string(), extractor_queue.clone()))
      .collect();
    operation_queues.insert("perform_reduce".into(), reducer_queue.clone());
    operation_queues.insert("perform_process_monitoring".into(), reducer_queue.clone());
    operation_queues.insert("perform_stream_capture".into(), streamer_queue.clone());
    operation_queues.insert("manage_host".into(), manager_queue.clone());

    Self {
      extractor_queue,
      reducer_queue,
      streamer_queue,
      manager_queue,
      global_model_queue: "qglobal_model".into(),
      global_retriever_queue: "qglobal_retriever".into(),
      global_model_enabled: true,
      global_retriever_enabled: true,
      operation_queues,
      restartable_operations: [
        "perform_video_decode",
        "perform_video_segmentation",
        "perform_detection",
        "perform_indexing",
        "perform_analysis",
        "perform_dataset_extraction",
        "perform_transformation",
      ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
      non_processing_operations: ["perform_model_import", "perform_training", "perform_training_set_creation"]
        .iter()
        .map(|s| s.to_string())
        .collect(),
      max_task_attempts: 3,
      reducer_timeout: Duration::from_secs(30),
      heartbeat_timeout: Duration::from_secs(600),
      queue_refresh_interval: Duration::from_secs(120),
      kube_mode: false,
      media_bucket: None,
      cloud_fs_enabled: false,
    }
  }
}

impl EngineSettings {
  pub fn from_env() -> Result<Self> {
    let mut settings = Self::default();
    if let Ok(v) = env::var("MEDIAFLOW_GLOBAL_MODEL_QUEUE") {
      settings.global_model_queue = v;
    }
    if let Ok(v) = env::var("MEDIAFLOW_GLOBAL_RETRIEVER_QUEUE") {
      settings.global_retriever_queue = v;
    }
    if let Some(v) = env_bool("MEDIAFLOW_GLOBAL_MODEL_ENABLED")? {
      settings.global_model_enabled = v;
    }
    if let Some(v) = env_bool("MEDIAFLOW_GLOBAL_RETRIEVER_ENABLED")? {
      settings.global_retriever_enabled = v;
    }
    if let Ok(v) = env::var("MEDIAFLOW_OPERATION_QUEUES") {
      settings.operation_queues.extend(parse_table(&v)?);
    }
    if let Ok(v) = env::var("MEDIAFLOW_RESTARTABLE_OPERATIONS") {
      settings.restartable_operations = parse_list(&v).collect();
    }
    if let Ok(v) = env::var("MEDIAFLOW_NON_PROCESSING_OPERATIONS") {
      settings.non_processing_operations = parse_list(&v).collect();
    }
    if let Ok(v) = env::var("MEDIAFLOW_MAX_TASK_ATTEMPTS") {
      settings.max_task_attempts = v.parse().context("MEDIAFLOW_MAX_TASK_ATTEMPTS")?;
    }
    if let Some(d) = env_secs("MEDIAFLOW_REDUCER_TIMEOUT_SECS")? {
      settings.reducer_timeout = d;
    }
    if let Some(d) = env_secs("MEDIAFLOW_HEARTBEAT_TIMEOUT_SECS")? {
      settings.heartbeat_timeout = d;
    }
    if let Some(d) = env_secs("MEDIAFLOW_QUEUE_REFRESH_SECS")? {
      settings.queue_refresh_interval = d;
    }
    if let Some(v) = env_bool("MEDIAFLOW_KUBE_MODE")? {
      settings.kube_mode = v;
    }
    settings.media_bucket = env::var("MEDIAFLOW_MEDIA_BUCKET").ok().filter(|s| !s.is_empty());
    if let Some(v) = env_bool("MEDIAFLOW_CLOUD_FS")? {
      settings.cloud_fs_enabled = v;
    }
    Ok(settings)
  }

  pub fn is_restartable(&self, operation: &str) -> bool {
    self.restartable_operations.contains(operation)
  }
}

fn parse_list(value: &str) -> impl Iterator<Item = String> + '_ {
  value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

/// Parses `op=queue,op=queue`.
fn parse_table(value: &str) -> Result<HashMap<String, String>> {
  parse_list(value)
    .map(|pair| {
      let (op, queue) = pair
        .split_once('=')
        .with_context(|| format!("expected operation=queue, got {pair}"))?;
      Ok((op.trim().to_string(), queue.trim().to_string()))
    })
    .collect()
}

fn env_bool(key: &str) -> Result<Option<bool>> {
  match env::var(key) {
    Ok(v) => match v.to_ascii_lowercase().as_str() {
      "1" | "true" | "yes" => Ok(Some(true)),
      "0" | "false" | "no" => Ok(Some(false)),
      other => anyhow::bail!("{key}: expected a boolean, got {other}"),
    },
    Err(_) => Ok(None),
  }
}

fn env_secs(key: &str) -> Result<Option<Duration>> {
  match env::var(key) {
    Ok(v) => Ok(Some(Duration::from_secs(v.parse().with_context(|| key.to_string())?))),
    Err(_) => Ok(None),
  }
}
