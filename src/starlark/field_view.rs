// starshift - a scriptable metric processor
// Copyright Starshift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./field_view_test.rs"]
mod field_view_test;

use super::marshal::{self, to_starlark_error};
use super::metric::{MetricRef, ViewError};
use crate::metric::FieldValue;
use allocative::Allocative;
use anyhow::anyhow;
use itertools::Itertools;
use starlark::any::ProvidesStaticType;
use starlark::collections::SmallMap;
use starlark::environment::{Methods, MethodsBuilder, MethodsStatic};
use starlark::starlark_module;
use starlark::values::list::AllocList;
use starlark::values::none::NoneType;
use starlark::values::{
  starlark_value,
  AllocValue,
  Heap,
  NoSerialize,
  StarlarkValue,
  Trace,
  Tracer,
  Value,
  ValueLike,
};
use std::fmt;

//
// FieldView
//

// Dict-like wrapper over a metric's fields. Same surface as the tag view with the value type
// widened to the host field-value union; every value crossing the boundary goes through the
// marshaller, so numeric and boolean fields round-trip without coercion.
#[derive(Debug, ProvidesStaticType, NoSerialize, Allocative)]
pub struct FieldView {
  #[allocative(skip)]
  cell: MetricRef,
}

impl FieldView {
  #[must_use]
  pub(super) fn new(cell: MetricRef) -> Self {
    Self { cell }
  }

  fn update_entries(&self, entries: Vec<(String, FieldValue)>) -> Result<(), ViewError> {
    self.cell.try_with_mut(|m| {
      if entries.iter().any(|(key, _)| !m.fields().contains_key(key)) {
        self.cell.fields_guard.check_structural()?;
      }
      for (key, value) in entries {
        m.fields_mut().insert(key, value);
      }
      Ok(())
    })
  }
}

impl fmt::Display for FieldView {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.cell.with(|m| {
      m.fields()
        .iter()
        .map(|(key, value)| format!("{key:?}: {value}"))
        .join(", ")
    }) {
      Ok(body) => write!(f, "{{{body}}}"),
      Err(_) => write!(f, "{{}}"),
    }
  }
}

unsafe impl<'v> Trace<'v> for FieldView {
  fn trace(&mut self, _tracer: &Tracer<'v>) {}
}

impl<'v> AllocValue<'v> for FieldView {
  fn alloc_value(self, heap: &'v Heap) -> Value<'v> {
    heap.alloc_complex_no_freeze(self)
  }
}

#[starlark_value(type = "Fields")]
impl<'v> StarlarkValue<'v> for FieldView {
  fn get_methods() -> Option<&'static Methods> {
    static RES: MethodsStatic = MethodsStatic::new();
    RES.methods(field_view_methods)
  }

  fn at(&self, index: Value<'v>, heap: &'v Heap) -> starlark::Result<Value<'v>> {
    index
      .unpack_str()
      .and_then(|key| {
        self
          .cell
          .with(|m| {
            m.fields()
              .get(key)
              .map(|value| marshal::field_value_to_script(value, heap))
          })
          .ok()
          .flatten()
      })
      .ok_or_else(|| to_starlark_error(ViewError::KeyNotFound(index.to_str())))
  }

  fn set_at(&self, index: Value<'v>, new_value: Value<'v>) -> starlark::Result<()> {
    let key = marshal::field_key_from_script(index).map_err(to_starlark_error)?;
    let value = marshal::field_value_from_script(new_value).map_err(to_starlark_error)?;
    self
      .cell
      .try_with_mut(|m| {
        if !m.fields().contains_key(&key) {
          self.cell.fields_guard.check_structural()?;
        }
        m.fields_mut().insert(key, value);
        Ok(())
      })
      .map_err(to_starlark_error)
  }

  fn length(&self) -> starlark::Result<i32> {
    let len = self
      .cell
      .with(|m| m.fields().len())
      .map_err(to_starlark_error)?;
    Ok(len.try_into().unwrap_or(i32::MAX))
  }

  fn is_in(&self, other: Value<'v>) -> starlark::Result<bool> {
    Ok(other.unpack_str().is_some_and(|key| {
      self
        .cell
        .with(|m| m.fields().contains_key(key))
        .unwrap_or(false)
    }))
  }

  fn to_bool(&self) -> bool {
    self.cell.with(|m| !m.fields().is_empty()).unwrap_or(false)
  }

  unsafe fn iterate(&self, me: Value<'v>, _heap: &'v Heap) -> starlark::Result<Value<'v>> {
    self.cell.fields_guard.enter();
    Ok(me)
  }

  unsafe fn iter_size_hint(&self, index: usize) -> (usize, Option<usize>) {
    let remaining = self
      .cell
      .with(|m| m.fields().len())
      .unwrap_or(0)
      .saturating_sub(index);
    (remaining, Some(remaining))
  }

  unsafe fn iter_next(&self, index: usize, heap: &'v Heap) -> Option<Value<'v>> {
    self
      .cell
      .with(|m| {
        m.fields()
          .get_index(index)
          .map(|(key, _)| heap.alloc(key.as_str()))
      })
      .ok()
      .flatten()
  }

  unsafe fn iter_stop(&self) {
    self.cell.fields_guard.exit();
  }
}

fn expect_field_view<'v>(value: Value<'v>) -> anyhow::Result<&'v FieldView> {
  value
    .downcast_ref::<FieldView>()
    .ok_or_else(|| anyhow!("expected a field view receiver, got '{}'", value.get_type()))
}

#[starlark_module]
fn field_view_methods(builder: &mut MethodsBuilder) {
  fn clear<'v>(this: Value<'v>) -> anyhow::Result<NoneType> {
    let view = expect_field_view(this)?;
    view.cell.fields_guard.check_structural()?;
    view.cell.with_mut(|m| m.fields_mut().clear())?;
    Ok(NoneType)
  }

  fn get<'v>(
    this: Value<'v>,
    #[starlark(require = pos)] key: Value<'v>,
    #[starlark(require = pos)] default: Option<Value<'v>>,
    heap: &'v Heap,
  ) -> anyhow::Result<Value<'v>> {
    let view = expect_field_view(this)?;
    let found = match key.unpack_str() {
      Some(key) => view.cell.with(|m| {
        m.fields()
          .get(key)
          .map(|value| marshal::field_value_to_script(value, heap))
      })?,
      None => None,
    };
    Ok(found.or(default).unwrap_or_else(|| Value::new_none()))
  }

  fn items<'v>(this: Value<'v>, heap: &'v Heap) -> anyhow::Result<Value<'v>> {
    let view = expect_field_view(this)?;
    let items = view.cell.with(|m| {
      m.fields()
        .iter()
        .map(|(key, value)| {
          heap.alloc((
            heap.alloc(key.as_str()),
            marshal::field_value_to_script(value, heap),
          ))
        })
        .collect::<Vec<_>>()
    })?;
    Ok(heap.alloc(AllocList(items)))
  }

  fn keys<'v>(this: Value<'v>, heap: &'v Heap) -> anyhow::Result<Value<'v>> {
    let view = expect_field_view(this)?;
    let keys = view.cell.with(|m| {
      m.fields()
        .keys()
        .map(|key| heap.alloc(key.as_str()))
        .collect::<Vec<_>>()
    })?;
    Ok(heap.alloc(AllocList(keys)))
  }

  fn values<'v>(this: Value<'v>, heap: &'v Heap) -> anyhow::Result<Value<'v>> {
    let view = expect_field_view(this)?;
    let values = view.cell.with(|m| {
      m.fields()
        .values()
        .map(|value| marshal::field_value_to_script(value, heap))
        .collect::<Vec<_>>()
    })?;
    Ok(heap.alloc(AllocList(values)))
  }

  fn pop<'v>(
    this: Value<'v>,
    #[starlark(require = pos)] key: Value<'v>,
    #[starlark(require = pos)] default: Option<Value<'v>>,
    heap: &'v Heap,
  ) -> anyhow::Result<Value<'v>> {
    let view = expect_field_view(this)?;
    if let Some(key) = key.unpack_str() {
      if view.cell.with(|m| m.fields().contains_key(key))? {
        view.cell.fields_guard.check_structural()?;
        if let Some(value) = view.cell.with_mut(|m| m.fields_mut().shift_remove(key))? {
          return Ok(marshal::field_value_to_script(&value, heap));
        }
      }
    }
    default.map_or_else(|| Err(ViewError::KeyNotFound(key.to_str()).into()), Ok)
  }

  fn popitem<'v>(this: Value<'v>, heap: &'v Heap) -> anyhow::Result<Value<'v>> {
    let view = expect_field_view(this)?;
    view.cell.fields_guard.check_structural()?;
    let (key, value) = view.cell.try_with_mut(|m| {
      m.fields_mut()
        .shift_remove_index(0)
        .ok_or(ViewError::EmptyDict)
    })?;
    Ok(heap.alloc((
      heap.alloc(key),
      marshal::field_value_to_script(&value, heap),
    )))
  }

  fn setdefault<'v>(
    this: Value<'v>,
    #[starlark(require = pos)] key: Value<'v>,
    #[starlark(require = pos)] default: Option<Value<'v>>,
    heap: &'v Heap,
  ) -> anyhow::Result<Value<'v>> {
    let view = expect_field_view(this)?;
    let key = marshal::field_key_from_script(key)?;
    if let Some(existing) = view.cell.with(|m| {
      m.fields()
        .get(&key)
        .map(|value| marshal::field_value_to_script(value, heap))
    })? {
      return Ok(existing);
    }
    let default = default.unwrap_or_else(|| Value::new_none());
    let value = marshal::field_value_from_script(default)?;
    view.cell.fields_guard.check_structural()?;
    view.cell.with_mut(|m| m.fields_mut().insert(key, value))?;
    Ok(default)
  }

  fn update<'v>(
    this: Value<'v>,
    #[starlark(require = pos)] pairs: Option<Value<'v>>,
    #[starlark(kwargs)] kwargs: SmallMap<String, Value<'v>>,
  ) -> anyhow::Result<NoneType> {
    let view = expect_field_view(this)?;
    let mut entries = Vec::new();
    if let Some(pairs) = pairs {
      for (key, value) in marshal::update_pairs(pairs)? {
        entries.push((
          marshal::field_key_from_script(key)?,
          marshal::field_value_from_script(value)?,
        ));
      }
    }
    for (key, value) in kwargs {
      entries.push((key, marshal::field_value_from_script(value)?));
    }
    view.update_entries(entries)?;
    Ok(NoneType)
  }
}
