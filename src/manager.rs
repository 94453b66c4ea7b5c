use chrono::Utc;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mediaflow::config::Config;
use mediaflow::database::{setup_database, PgStore};
use mediaflow::engine::Engine;
use mediaflow::health::{CommandLauncher, SysinfoProbe, WorkerHealthMonitor};
use mediaflow::messaging::{create_rabbit_channel, RabbitTransport};
use mediaflow::monitor::{NullRuntime, ProcessMonitor};
use mediaflow::worker_processing::{heartbeat_loop, register_worker, HEARTBEAT_INTERVAL};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mediaflow=info")))
    .init();
  let config = Config::from_env()?;
  let sweep_every = Duration::from_secs(
    env::var("MEDIAFLOW_SWEEP_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(30),
  );
  let worker_program = env::var("MEDIAFLOW_WORKER_BIN").unwrap_or_else(|_| "mediaflow_worker".into());

  let db_pool = setup_database(&config.database_url).await?;
  let rabbit_channel = create_rabbit_channel(&config.rabbitmq_url).await?;
  let engine = Engine::new(
    Arc::new(PgStore::new(db_pool)),
    Arc::new(RabbitTransport::new(rabbit_channel)),
    config.engine,
  );

  let manager = register_worker(&engine, &engine.settings.manager_queue).await?;
  tokio::spawn(heartbeat_loop(engine.store.clone(), manager.id, HEARTBEAT_INTERVAL));

  let health = WorkerHealthMonitor::new(
    engine.clone(),
    manager.host.clone(),
    Arc::new(SysinfoProbe::new()),
    Arc::new(CommandLauncher::new(worker_program)),
  );
  let monitor = ProcessMonitor::new(engine.clone(), Arc::new(NullRuntime));
  info!("manager {} sweeping every {:?}", manager.id, sweep_every);

  let mut ticker = tokio::time::interval(sweep_every);
  loop {
    ticker.tick().await;
    match health.sweep(Utc::now()).await {
      Ok(report) => {
        if !report.dead.is_empty() {
          info!("{} dead workers, {} tasks errored, relaunched {:?}", report.dead.len(), report.errored_tasks.len(), report.relaunched);
        }
        if report.exit_requested {
          warn!("dead workers under host-managed scheduling, exiting so the scheduler replaces this agent");
          return Ok(());
        }
      }
      Err(e) => error!("worker health sweep failed: {}", e),
    }
    match monitor.sweep_all().await {
      Ok(swept) => {
        let completed = swept.iter().filter(|(_, s)| s.completed).count();
        if completed > 0 {
          info!("{} processes completed", completed);
        }
      }
      Err(e) => error!("process monitor sweep failed: {}", e),
    }
  }
}
