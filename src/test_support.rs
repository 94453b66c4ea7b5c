//! Shared fixtures for unit tests.

use serde_json::Value;
use std::sync::Arc;

use crate::config::EngineSettings;
use crate::engine::Engine;
use crate::memory_store::MemoryStore;
use crate::messaging::MemoryTransport;
use crate::models::Arguments;

pub fn args(value: Value) -> Arguments {
  value.as_object().cloned().unwrap_or_default()
}

pub fn engine() -> (Engine, Arc<MemoryStore>, Arc<MemoryTransport>) {
  engine_with(EngineSettings::default())
}

pub fn engine_with(settings: EngineSettings) -> (Engine, Arc<MemoryStore>, Arc<MemoryTransport>) {
  let store = Arc::new(MemoryStore::new());
  let transport = Arc::new(MemoryTransport::new());
  let engine = Engine::new(store.clone(), transport.clone(), settings);
  (engine, store, transport)
}
