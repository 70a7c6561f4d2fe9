// starshift - a scriptable metric processor
// Copyright Starshift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./mod_test.rs"]
mod mod_test;

pub mod field_view;
pub mod marshal;
pub mod metric;
pub mod tag_view;

use self::metric::{MetricCell, MetricRef, StarlarkMetric};
use crate::metric::Metric;
use anyhow::{anyhow, bail};
use starlark::docs::{DocItem, DocParam};
use starlark::environment::{FrozenModule, Globals, GlobalsBuilder, Module};
use starlark::eval::Evaluator;
use starlark::starlark_module;
use starlark::syntax::{AstModule, Dialect};
use starlark::values::list::ListRef;
use starlark::values::tuple::TupleRef;
use starlark::values::{Heap, OwnedFrozenValue, Value, ValueLike};
use std::rc::Rc;
use thiserror::Error;

// The single entry point a user script must bind.
const APPLY: &str = "apply";

// Synthetic file name attached to script diagnostics.
const SOURCE_NAME: &str = "<source>";

//
// ApplyError
//

// Failure modes of a single apply() invocation. The input metric is handled per the processor's
// on-error policy when one of these comes back.
#[derive(Error, Debug)]
pub enum ApplyError {
  #[error("script error: {0}")]
  Script(String),
  #[error("apply must return None, a metric, or a sequence of metrics, got '{0}'")]
  InvalidReturn(String),
  #[error("apply returned more than one reference to the same metric")]
  DuplicateReference,
}

//
// ApplyOutcome
//

// Result of one invocation. `emitted` preserves the script's return order and owns the metrics
// to forward. A metric handed to the script that did not come back ends up in `released` for the
// pipeline's drop hook. `error` implies no emissions.
#[derive(Debug)]
pub struct ApplyOutcome {
  pub emitted: Vec<Metric>,
  pub released: Vec<Metric>,
  pub error: Option<ApplyError>,
}

//
// ProgramWrapper
//

// A user script compiled and frozen once at configuration time, invoked once per metric. The
// frozen module scope is shared across invocations; each invocation gets a fresh evaluation
// module so nothing the script allocates can outlive the call.
pub struct ProgramWrapper {
  module: FrozenModule,
  apply: OwnedFrozenValue,
}

impl ProgramWrapper {
  pub fn new(source: &str) -> anyhow::Result<Self> {
    if source.trim().is_empty() {
      bail!("script source must not be empty");
    }

    let ast = AstModule::parse(SOURCE_NAME, source.to_string(), &Dialect::Standard)
      .map_err(|e| anyhow!("script parse error: {e}"))?;

    let module = Module::new();
    {
      let mut eval = Evaluator::new(&module);
      eval
        .eval_module(ast, &globals())
        .map_err(|e| anyhow!("script initialization error: {e}"))?;
    }
    let module = module
      .freeze()
      .map_err(|e| anyhow!("failed to freeze the script module scope: {e}"))?;

    let apply = module
      .get(APPLY)
      .map_err(|e| anyhow!("script must define an apply(metric) function: {e}"))?;
    validate_apply(apply.value())?;

    Ok(Self { module, apply })
  }

  // Run apply() against one metric. Ownership of the sample moves into the call; it comes back
  // through the outcome, either emitted or released.
  #[must_use]
  pub fn run_with_metric(&self, sample: Metric) -> ApplyOutcome {
    let cell = MetricCell::wrap(sample);
    let module = Module::new();
    module.frozen_heap().add_reference(self.module.frozen_heap());

    let result = {
      let mut eval = Evaluator::new(&module);
      let wrapper = module.heap().alloc(StarlarkMetric::new(cell.clone()));
      eval
        .eval_function(self.apply.value(), &[wrapper], &[])
        .map_err(|e| ApplyError::Script(e.to_string()))
        .and_then(collect_returned)
    };

    match result {
      Ok(cells) => {
        let mut emitted = Vec::with_capacity(cells.len());
        for returned in cells {
          if let Some(metric) = returned.take() {
            emitted.push(metric);
          }
        }
        ApplyOutcome {
          emitted,
          released: cell.take().into_iter().collect(),
          error: None,
        }
      },
      Err(error) => ApplyOutcome {
        emitted: Vec::new(),
        released: cell.take().into_iter().collect(),
        error: Some(error),
      },
    }
  }
}

// Interpret the value apply() returned while the invocation heap is still alive: None means no
// metrics, a metric value means one, a list or tuple of metric values means many, in order. Two
// entries backed by the same cell are an aliasing error and nothing is emitted.
fn collect_returned(ret: Value<'_>) -> Result<Vec<MetricRef>, ApplyError> {
  if ret.is_none() {
    return Ok(Vec::new());
  }

  let items: Vec<Value<'_>> = if let Some(list) = ListRef::from_value(ret) {
    list.content().to_vec()
  } else if let Some(tuple) = TupleRef::from_value(ret) {
    tuple.content().to_vec()
  } else {
    vec![ret]
  };

  let mut cells: Vec<MetricRef> = Vec::with_capacity(items.len());
  for item in items {
    let Some(wrapper) = item.downcast_ref::<StarlarkMetric>() else {
      return Err(ApplyError::InvalidReturn(item.get_type().to_string()));
    };
    let cell = wrapper.cell().clone();
    if cells.iter().any(|existing| Rc::ptr_eq(existing, &cell)) {
      return Err(ApplyError::DuplicateReference);
    }
    cells.push(cell);
  }
  Ok(cells)
}

fn validate_apply(apply: Value<'_>) -> anyhow::Result<()> {
  if apply.get_type() != "function" {
    bail!("'apply' must be a function, got '{}'", apply.get_type());
  }

  // The compiled function's documentation carries its signature. Arity problems in signatures we
  // cannot introspect surface at call time instead.
  if let Some(DocItem::Function(function)) = apply.documentation() {
    let mut positional = 0_usize;
    let mut variadic = false;
    for param in &function.params {
      match param {
        DocParam::Arg { .. } => positional += 1,
        DocParam::Args { .. } | DocParam::Kwargs { .. } => variadic = true,
        _ => {},
      }
    }
    if positional != 1 || variadic {
      bail!("'apply' must take exactly one positional argument");
    }
  }
  Ok(())
}

// The sandboxed global environment: the interpreter's standard builtins (no I/O, clock,
// randomness, or environment access) plus the metric constructors.
fn globals() -> Globals {
  GlobalsBuilder::standard().with(metric_globals).build()
}

#[starlark_module]
fn metric_globals(builder: &mut GlobalsBuilder) {
  /// Create a new, independent metric with the given name, no tags or fields, and timestamp 0.
  #[allow(non_snake_case)]
  fn Metric<'v>(
    #[starlark(require = pos)] name: &str,
    heap: &'v Heap,
  ) -> anyhow::Result<Value<'v>> {
    Ok(heap.alloc(StarlarkMetric::new(MetricCell::wrap(Metric::new(name)))))
  }

  /// Return a metric backed by a fresh copy of `metric`, sharing no state with the original.
  fn deepcopy<'v>(
    #[starlark(require = pos)] metric: Value<'v>,
    heap: &'v Heap,
  ) -> anyhow::Result<Value<'v>> {
    let Some(wrapper) = metric.downcast_ref::<StarlarkMetric>() else {
      bail!("deepcopy() argument must be a metric, got '{}'", metric.get_type());
    };
    let copy = wrapper.cell().with(Clone::clone)?;
    Ok(heap.alloc(StarlarkMetric::new(MetricCell::wrap(copy))))
  }
}
