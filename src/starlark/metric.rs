// starshift - a scriptable metric processor
// Copyright Starshift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./metric_test.rs"]
mod metric_test;

use super::field_view::FieldView;
use super::marshal::{self, to_starlark_error};
use super::tag_view::TagView;
use crate::metric::Metric;
use allocative::Allocative;
use anyhow::anyhow;
use starlark::any::ProvidesStaticType;
use starlark::values::{
  starlark_value,
  AllocValue,
  Heap,
  NoSerialize,
  StarlarkValue,
  Trace,
  Tracer,
  Value,
};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

//
// ViewError
//

// Failed dictionary-view operations. These surface to the script as evaluation errors and abort
// the invocation.
#[derive(Error, Debug, Eq, PartialEq)]
pub enum ViewError {
  #[error("key '{0}' not found")]
  KeyNotFound(String),
  #[error("popitem(): dictionary is empty")]
  EmptyDict,
  #[error("cannot mutate while iterating")]
  MutateWhileIterating,
  #[error("metric is no longer owned by the script")]
  Consumed,
}

//
// IterationGuard
//

// Counts live iterators over one of the metric's maps. Nested iteration stacks; the evaluator
// pairs every iteration start with a stop on all exit paths, including script errors.
#[derive(Debug, Default)]
pub struct IterationGuard {
  active: Cell<usize>,
}

impl IterationGuard {
  pub fn enter(&self) {
    self.active.set(self.active.get() + 1);
  }

  pub fn exit(&self) {
    self.active.set(self.active.get().saturating_sub(1));
  }

  // Structural changes (insert of a new key, removal, clear) are rejected while any iterator is
  // live. Replacing the value of an existing key is not structural.
  pub fn check_structural(&self) -> Result<(), ViewError> {
    if self.active.get() > 0 {
      Err(ViewError::MutateWhileIterating)
    } else {
      Ok(())
    }
  }
}

//
// MetricCell
//

// Host metric shared between a script metric value and its tag/field views. The Rc identity of
// the cell is what return-value alias detection compares. take() moves the metric back to the
// host when apply() returns, invalidating any remaining script wrappers.
#[derive(Debug)]
pub struct MetricCell {
  metric: RefCell<Option<Metric>>,
  pub tags_guard: IterationGuard,
  pub fields_guard: IterationGuard,
}

pub type MetricRef = Rc<MetricCell>;

impl MetricCell {
  #[must_use]
  pub fn wrap(metric: Metric) -> MetricRef {
    Rc::new(Self {
      metric: RefCell::new(Some(metric)),
      tags_guard: IterationGuard::default(),
      fields_guard: IterationGuard::default(),
    })
  }

  pub fn take(&self) -> Option<Metric> {
    self.metric.borrow_mut().take()
  }

  pub fn with<R>(&self, f: impl FnOnce(&Metric) -> R) -> Result<R, ViewError> {
    self.metric.borrow().as_ref().map(f).ok_or(ViewError::Consumed)
  }

  pub fn with_mut<R>(&self, f: impl FnOnce(&mut Metric) -> R) -> Result<R, ViewError> {
    self
      .metric
      .borrow_mut()
      .as_mut()
      .map(f)
      .ok_or(ViewError::Consumed)
  }

  pub fn try_with_mut<R>(
    &self,
    f: impl FnOnce(&mut Metric) -> Result<R, ViewError>,
  ) -> Result<R, ViewError> {
    self.with_mut(f)?
  }
}

//
// StarlarkMetric
//

// Script-visible projection of a host metric with the attributes name, tags, fields, and time.
// The tag and field views are allocated once per wrapper and cached, so repeated attribute reads
// observe the same view value and iterator accounting stays coherent.
#[derive(Debug, ProvidesStaticType, NoSerialize, Allocative)]
pub struct StarlarkMetric<'v> {
  #[allocative(skip)]
  cell: MetricRef,
  #[allocative(skip)]
  tags_view: RefCell<Option<Value<'v>>>,
  #[allocative(skip)]
  fields_view: RefCell<Option<Value<'v>>>,
}

impl<'v> StarlarkMetric<'v> {
  #[must_use]
  pub fn new(cell: MetricRef) -> Self {
    Self {
      cell,
      tags_view: RefCell::new(None),
      fields_view: RefCell::new(None),
    }
  }

  #[must_use]
  pub fn cell(&self) -> &MetricRef {
    &self.cell
  }

  fn tags_view(&self, heap: &'v Heap) -> Value<'v> {
    *self
      .tags_view
      .borrow_mut()
      .get_or_insert_with(|| heap.alloc(TagView::new(self.cell.clone())))
  }

  fn fields_view(&self, heap: &'v Heap) -> Value<'v> {
    *self
      .fields_view
      .borrow_mut()
      .get_or_insert_with(|| heap.alloc(FieldView::new(self.cell.clone())))
  }
}

impl fmt::Display for StarlarkMetric<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.cell.with(ToString::to_string) {
      Ok(metric) => write!(f, "Metric({metric})"),
      Err(_) => write!(f, "Metric(<released>)"),
    }
  }
}

unsafe impl<'v> Trace<'v> for StarlarkMetric<'v> {
  fn trace(&mut self, tracer: &Tracer<'v>) {
    self.tags_view.get_mut().trace(tracer);
    self.fields_view.get_mut().trace(tracer);
  }
}

impl<'v> AllocValue<'v> for StarlarkMetric<'v> {
  fn alloc_value(self, heap: &'v Heap) -> Value<'v> {
    heap.alloc_complex_no_freeze(self)
  }
}

#[starlark_value(type = "Metric")]
impl<'v> StarlarkValue<'v> for StarlarkMetric<'v> {
  fn get_attr(&self, attribute: &str, heap: &'v Heap) -> Option<Value<'v>> {
    match attribute {
      "name" => self.cell.with(|m| heap.alloc(m.name())).ok(),
      "time" => self.cell.with(|m| heap.alloc(m.timestamp())).ok(),
      "tags" => Some(self.tags_view(heap)),
      "fields" => Some(self.fields_view(heap)),
      _ => None,
    }
  }

  fn set_attr(&self, attribute: &str, new_value: Value<'v>) -> starlark::Result<()> {
    match attribute {
      "name" => {
        let name = marshal::name_from_script(new_value).map_err(to_starlark_error)?;
        self
          .cell
          .with_mut(|m| m.set_name(name))
          .map_err(to_starlark_error)
      },
      "time" => {
        let timestamp = marshal::timestamp_from_script(new_value).map_err(to_starlark_error)?;
        self
          .cell
          .with_mut(|m| m.set_timestamp(timestamp))
          .map_err(to_starlark_error)
      },
      "tags" | "fields" => Err(to_starlark_error(anyhow!(
        "cannot assign to the '{attribute}' attribute of a metric"
      ))),
      _ => Err(to_starlark_error(anyhow!(
        "metric has no attribute '{attribute}'"
      ))),
    }
  }

  fn dir_attr(&self) -> Vec<String> {
    ["fields", "name", "tags", "time"]
      .map(str::to_string)
      .to_vec()
  }
}
