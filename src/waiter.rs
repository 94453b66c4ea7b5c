//! Reduce barrier evaluation.
//!
//! A reduce task is created eagerly next to the work it waits for. Each time
//! it is delivered the waiter checks its barrier; while pending, the task is
//! re-sent with a delay and its side effects are not run. Evaluation only
//! reads the store, so it can be repeated any number of times.

use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{Process, Task};
use crate::specification::ProcessSpecification;
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReduceTarget {
  /// Siblings under the same parent.
  Root,
  /// Siblings and all their descendants.
  All,
  /// Like `All`, restricted to the named task groups and their ancestors.
  Filter(Vec<String>),
}

impl ReduceTarget {
  pub fn from_arguments(task: &Task) -> EngineResult<Self> {
    let target = task
      .arguments
      .get("reduce_target")
      .and_then(Value::as_str)
      .ok_or_else(|| EngineError::spec(format!("reduce task {} has no reduce_target", task.id)))?;
    match target {
      "root" => Ok(ReduceTarget::Root),
      "all" => Ok(ReduceTarget::All),
      "filter" => {
        let names = task
          .arguments
          .get("reduce_filter")
          .and_then(Value::as_array)
          .ok_or_else(|| EngineError::spec("reduce_target filter requires a reduce_filter list"))?
          .iter()
          .map(|v| {
            v.as_str()
              .map(String::from)
              .ok_or_else(|| EngineError::spec(format!("reduce_filter entry {v} is not a group name")))
          })
          .collect::<EngineResult<Vec<_>>>()?;
        Ok(ReduceTarget::Filter(names))
      }
      other => Err(EngineError::spec(format!("{other} is not a valid reduce_target"))),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
  Pending { waiting_on: Uuid },
  Satisfied,
}

pub struct Waiter<'a> {
  store: &'a dyn Store,
  task: &'a Task,
  target: ReduceTarget,
}

impl<'a> Waiter<'a> {
  pub fn new(store: &'a dyn Store, task: &'a Task) -> EngineResult<Self> {
    Ok(Self { store, task, target: ReduceTarget::from_arguments(task)? })
  }

  pub async fn evaluate(&self, process: &Process) -> EngineResult<BarrierState> {
    let Some(parent_id) = self.task.parent else {
      return Ok(BarrierState::Satisfied);
    };
    let parent = self.store.get_task(parent_id).await?;
    if !parent.is_terminal() {
      return Ok(self.pending(&parent));
    }

    let groups = match &self.target {
      ReduceTarget::Filter(names) => Some(group_closure(names, &process.specification)?),
      _ => None,
    };
    let in_scope = |t: &Task| groups.as_ref().is_none_or(|g| g.contains(&t.task_group_id));

    // Sibling reduce tasks are never waited on; two barriers at one level would deadlock.
    let siblings: Vec<Task> = self
      .store
      .children_of(parent_id)
      .await?
      .into_iter()
      .filter(|t| t.id != self.task.id && !t.is_reduce())
      .collect();
    if let Some(blocking) = siblings.iter().find(|t| in_scope(*t) && !t.is_terminal()) {
      return Ok(self.pending(blocking));
    }
    if self.target == ReduceTarget::Root {
      return Ok(BarrierState::Satisfied);
    }

    let mut stack: Vec<Uuid> = siblings.iter().map(|t| t.id).collect();
    while let Some(id) = stack.pop() {
      for child in self.store.children_of(id).await? {
        stack.push(child.id);
        if !child.is_reduce() && in_scope(&child) && !child.is_terminal() {
          return Ok(self.pending(&child));
        }
      }
    }
    Ok(BarrierState::Satisfied)
  }

  fn pending(&self, blocking: &Task) -> BarrierState {
    debug!(
      "reduce {} waiting on {} running {} on {}",
      self.task.id, blocking.id, blocking.operation, blocking.queue
    );
    BarrierState::Pending { waiting_on: blocking.id }
  }
}

/// The named groups plus every ancestor group up to the root.
pub fn group_closure(names: &[String], specification: &ProcessSpecification) -> EngineResult<BTreeSet<i64>> {
  let mut closure = BTreeSet::new();
  for name in names {
    let mut index = *specification
      .task_group_name_to_index
      .get(name)
      .ok_or_else(|| EngineError::spec(format!("unknown task group name {name} in reduce_filter")))?;
    while closure.insert(index) {
      match specification.parent_task_group_index.get(&index) {
        Some(parent) => index = *parent,
        None => break,
      }
    }
  }
  Ok(closure)
}
