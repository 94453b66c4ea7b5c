use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use tracing::{error, info, warn};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::process::ProcessLauncher;
use crate::specification::ProcessSpecification;

#[derive(Serialize)]
pub struct SubmitResponse {
  pub process_id: Uuid,
  pub status: String,
  pub sse_url: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

#[derive(Debug)]
pub(crate) struct CustomError {
  pub(crate) message: String,
}
impl warp::reject::Reject for CustomError {}

pub(crate) fn reject(message: impl Into<String>) -> Rejection {
  warp::reject::custom(CustomError { message: message.into() })
}

pub(crate) fn with_engine(engine: Engine) -> impl Filter<Extract = (Engine,), Error = Infallible> + Clone {
  warp::any().map(move || engine.clone())
}

pub fn submit_route(engine: Engine) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path("processes")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::body::json())
    .and(with_engine(engine))
    .and_then(handle_submit)
}

pub fn get_route(engine: Engine) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("processes" / Uuid)
    .and(warp::get())
    .and(with_engine(engine))
    .and_then(handle_get)
}

async fn handle_submit(specification: ProcessSpecification, engine: Engine) -> Result<impl Reply, Rejection> {
  let mut launcher = ProcessLauncher::create_from_spec(engine, specification)
    .await
    .map_err(|e| {
      warn!("Process creation failed: {}", e);
      reject(e.to_string())
    })?;
  let process_id = launcher.process().id;
  let (status, error) = match launcher.launch().await {
    Ok(()) => ("launched", None),
    Err(e) if e.is_specification() => ("failed", Some(e.to_string())),
    Err(e) => {
      error!("Failed to launch process {}: {:?}", process_id, e);
      return Err(reject("An error occurred when launching the process."));
    }
  };
  info!("Process {} submitted ({})", process_id, status);
  Ok(warp::reply::json(&SubmitResponse {
    process_id,
    status: status.into(),
    sse_url: format!("/sse?process_id={process_id}"),
    error,
  }))
}

async fn handle_get(id: Uuid, engine: Engine) -> Result<impl Reply, Rejection> {
  match engine.store.get_process(id).await {
    Ok(process) => Ok(warp::reply::json(&process)),
    Err(EngineError::NotFound { .. }) => Err(warp::reject::not_found()),
    Err(e) => {
      error!("Failed to load process {}: {:?}", id, e);
      Err(reject("An error occurred when loading the process."))
    }
  }
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let (status, message) = if err.is_not_found() {
    (StatusCode::NOT_FOUND, "Not found".to_string())
  } else if let Some(custom) = err.find::<CustomError>() {
    (StatusCode::BAD_REQUEST, custom.message.clone())
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
  } else {
    (StatusCode::INTERNAL_SERVER_ERROR, "Unhandled rejection".to_string())
  };
  Ok(warp::reply::with_status(warp::reply::json(&json!({"error": message})), status))
}
