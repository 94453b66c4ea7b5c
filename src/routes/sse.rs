use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use tracing::warn;
use uuid::Uuid;
use warp::{Filter, Rejection, Reply};

use super::processes::{reject, with_engine};
use crate::engine::Engine;

pub fn sse_route(engine: Engine) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path("sse")
    .and(warp::get())
    .and(warp::query::<HashMap<String, String>>())
    .and(with_engine(engine))
    .and_then(handle_sse)
}

/// Emits the process state every two seconds once it has completed or failed.
async fn handle_sse(query: HashMap<String, String>, engine: Engine) -> Result<impl Reply, Rejection> {
  let process_id: Uuid = query
    .get("process_id")
    .ok_or_else(|| reject("Missing process_id"))?
    .parse()
    .map_err(|_| reject("Invalid process_id"))?;

  let interval = IntervalStream::new(tokio::time::interval(Duration::from_secs(2)));
  let stream = interval
    .then(move |_| {
      let engine = engine.clone();
      async move {
        match engine.store.get_process(process_id).await {
          Ok(process) if process.completed || process.failed => {
            let event = warp::sse::Event::default().data(
              json!({
                "process_id": process_id,
                "completed": process.completed,
                "failed": process.failed,
                "error_message": process.error_message,
              })
              .to_string(),
            );
            Some(Ok::<_, Infallible>(event))
          }
          Ok(_) => None,
          Err(e) => {
            warn!("Error fetching process status: {:?}", e);
            None
          }
        }
      }
    })
    .filter_map(|x| x);

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}
