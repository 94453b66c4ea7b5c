//! Process specification documents.
//!
//! A specification is a tree of operation nodes. Children live inside a node's
//! `arguments` under `map` (launched when the node's task finishes) and
//! `reduce` (barrier tasks created at the same time, run once their waiter is
//! satisfied). Once launched, a task carries its node's arguments, nested
//! children included, so continuations can be expanded from the task alone.

use serde::{Serialize, Deserialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{EngineError, EngineResult};
use crate::models::{Arguments, ProcessType};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessSpecification {
  pub process_type: ProcessType,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub create: Vec<CreateEntry>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub delete: Vec<DeleteEntry>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub map: Vec<OperationNode>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub reduce: Vec<OperationNode>,
  /// Inline query payload, cleared once stored.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub image_data_b64: Option<String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub task_group_name_to_index: BTreeMap<String, i64>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub parent_task_group_index: BTreeMap<i64, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateEntry {
  #[serde(rename = "MODEL")]
  pub model: String,
  #[serde(default)]
  pub spec: Arguments,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteEntry {
  #[serde(rename = "MODEL")]
  pub model: String,
  #[serde(default)]
  pub selector: Arguments,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OperationNode {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub operation: Option<String>,
  #[serde(default)]
  pub arguments: NodeArguments,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub task_group_id: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub video_id: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub training_set_id: Option<Value>,
}

impl OperationNode {
  pub fn new(operation: impl Into<String>) -> Self {
    Self {
      operation: Some(operation.into()),
      ..Self::default()
    }
  }

  pub fn operation(&self) -> EngineResult<&str> {
    self.operation
      .as_deref()
      .ok_or_else(|| EngineError::spec("operation node without an operation"))
  }

  pub fn task_group_name(&self) -> Option<&str> {
    self.arguments.fields.get("task_group_name").and_then(Value::as_str)
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeArguments {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub map: Vec<OperationNode>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub reduce: Vec<OperationNode>,
  #[serde(flatten)]
  pub fields: Arguments,
}

impl NodeArguments {
  /// Reads the continuation lists back out of a task's arguments.
  pub fn from_arguments(arguments: &Arguments) -> EngineResult<Self> {
    Ok(serde_json::from_value(Value::Object(arguments.clone()))?)
  }

  pub fn to_arguments(&self) -> EngineResult<Arguments> {
    match serde_json::to_value(self)? {
      Value::Object(map) => Ok(map),
      _ => Err(EngineError::spec("node arguments must be an object")),
    }
  }
}
