pub mod builder;
pub mod config;
pub mod continuation;
pub mod database;
pub mod engine;
pub mod error;
pub mod groups;
pub mod handlers;
pub mod health;
pub mod memory_store;
pub mod messaging;
pub mod models;
pub mod monitor;
pub mod process;
pub mod restart;
pub mod router;
pub mod routes;
pub mod specification;
pub mod store;
pub mod substitutor;
pub mod waiter;
pub mod worker_processing;
pub mod worker_scheduler;

#[cfg(test)]
pub(crate) mod test_support;
