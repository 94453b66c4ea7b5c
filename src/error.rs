use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  /// Malformed process specification. Recorded on the Process and never retried.
  #[error("specification error: {0}")]
  Specification(String),
  #[error("{kind} {id} not found")]
  NotFound { kind: &'static str, id: Uuid },
  #[error("no handler registered for operation {0}")]
  UnknownOperation(String),
  #[error("handler failed: {0}")]
  Handler(String),
  #[error("timed out waiting for {0}")]
  Timeout(String),
  #[error("storage error: {0}")]
  Storage(String),
  #[error(transparent)]
  Database(#[from] sqlx::Error),
  #[error(transparent)]
  Transport(#[from] lapin::Error),
  #[error(transparent)]
  Serialization(#[from] serde_json::Error),
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl EngineError {
  pub fn spec(message: impl Into<String>) -> Self {
    EngineError::Specification(message.into())
  }

  pub fn is_specification(&self) -> bool {
    matches!(self, EngineError::Specification(_))
  }
}

pub type EngineResult<T> = Result<T, EngineError>;
