use std::collections::BTreeMap;
use tracing::warn;

use crate::specification::{OperationNode, ProcessSpecification};

/// Assigns task group ids to specification nodes in pre-order.
///
/// Ids are unique within one process. Duplicate `task_group_name`s are
/// collected as errors instead of aborting, since assignment runs before any
/// task exists; the caller flags the process.
#[derive(Debug, Default)]
pub struct TaskGroupAssigner {
  next_index: i64,
  name_to_index: BTreeMap<String, i64>,
  parent_index: BTreeMap<i64, i64>,
  errors: Vec<String>,
}

impl TaskGroupAssigner {
  pub fn new() -> Self {
    Self::default()
  }

  /// Reserves the next id for a task that has no specification node.
  pub fn reserve(&mut self) -> i64 {
    let index = self.next_index;
    self.next_index += 1;
    index
  }

  pub fn assign(&mut self, nodes: &mut [OperationNode], parent_group_id: Option<i64>) {
    for node in nodes.iter_mut() {
      let index = self.reserve();
      node.task_group_id = Some(index);
      if let Some(parent) = parent_group_id {
        self.parent_index.insert(index, parent);
      }
      if let Some(name) = node.task_group_name() {
        if self.name_to_index.contains_key(name) {
          warn!("task group name {} used more than once", name);
          self.errors.push(format!("Repeated task group name {name}."));
        } else {
          self.name_to_index.insert(name.to_string(), index);
        }
      }
      self.assign(&mut node.arguments.map, Some(index));
      self.assign(&mut node.arguments.reduce, Some(index));
    }
  }

  pub fn errors(&self) -> &[String] {
    &self.errors
  }

  pub fn name_to_index(&self) -> &BTreeMap<String, i64> {
    &self.name_to_index
  }

  pub fn parent_index(&self) -> &BTreeMap<i64, i64> {
    &self.parent_index
  }

  /// Appends the bookkeeping maps to the specification.
  pub fn record_into(&self, specification: &mut ProcessSpecification) {
    specification.task_group_name_to_index = self.name_to_index.clone();
    specification.parent_task_group_index = self.parent_index.clone();
  }
}
