//! Placeholder resolution in task arguments.
//!
//! `filters: "__parent__"` copies the parent task's filters; inside a filters
//! object `"__parent_event__"` and `"__grand_parent_event__"` become the
//! parent and grandparent task ids. Injected filters and then batch filters
//! are merged on top. The input is never mutated.

use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::models::{Arguments, Task};

pub const PARENT_FILTERS: &str = "__parent__";
pub const PARENT_EVENT: &str = "__parent_event__";
pub const GRAND_PARENT_EVENT: &str = "__grand_parent_event__";

pub fn substitute(
  arguments: &Arguments,
  parent: &Task,
  inject_filters: Option<&Arguments>,
  map_filters: &Arguments,
) -> EngineResult<Arguments> {
  let mut args = arguments.clone();
  let inherit = matches!(args.get("filters"), Some(Value::String(token)) if token == PARENT_FILTERS);
  if inherit {
    let inherited = parent
      .arguments
      .get("filters")
      .cloned()
      .unwrap_or_else(|| Value::Object(Arguments::new()));
    args.insert("filters".into(), inherited);
  } else if let Some(Value::Object(filters)) = args.get_mut("filters") {
    for value in filters.values_mut() {
      let resolved = match value.as_str() {
        Some(PARENT_EVENT) => Some(parent.id),
        Some(GRAND_PARENT_EVENT) => Some(parent.parent.ok_or_else(|| {
          EngineError::spec(format!("{GRAND_PARENT_EVENT} used below task {} which has no parent", parent.id))
        })?),
        _ => None,
      };
      if let Some(id) = resolved {
        *value = Value::String(id.to_string());
      }
    }
  }
  if let Some(inject) = inject_filters {
    merge_filters(&mut args, inject)?;
  }
  merge_filters(&mut args, map_filters)?;
  Ok(args)
}

/// Merges `extra` into `args["filters"]`, creating it when absent. Later keys win.
pub fn merge_filters(args: &mut Arguments, extra: &Arguments) -> EngineResult<()> {
  if extra.is_empty() {
    return Ok(());
  }
  let filters = args
    .entry("filters")
    .or_insert_with(|| Value::Object(Arguments::new()));
  match filters {
    Value::Object(existing) => {
      for (k, v) in extra {
        existing.insert(k.clone(), v.clone());
      }
      Ok(())
    }
    other => Err(EngineError::spec(format!("cannot merge filters into unresolved value {other}"))),
  }
}
