use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mediaflow::config::Config;
use mediaflow::database::{setup_database, PgStore};
use mediaflow::engine::Engine;
use mediaflow::messaging::{create_rabbit_channel, RabbitTransport};
use mediaflow::routes::routes;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mediaflow=info")))
    .init();
  let config = Config::from_env()?;
  let db_pool = setup_database(&config.database_url).await?;
  let rabbit_channel = create_rabbit_channel(&config.rabbitmq_url).await?;

  let engine = Engine::new(
    Arc::new(PgStore::new(db_pool)),
    Arc::new(RabbitTransport::new(rabbit_channel)),
    config.engine,
  );

  info!("API listening on port {}", config.server_port);
  warp::serve(routes(engine))
    .run(([0, 0, 0, 0], config.server_port))
    .await;
  Ok(())
}
