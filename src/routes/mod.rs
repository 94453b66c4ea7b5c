use std::convert::Infallible;
use warp::Filter;

use crate::engine::Engine;

pub mod processes;
pub mod sse;

pub fn routes(engine: Engine) -> impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone {
  processes::submit_route(engine.clone())
    .or(processes::get_route(engine.clone()))
    .or(sse::sse_route(engine))
    .recover(processes::handle_rejection)
}
