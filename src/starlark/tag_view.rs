// starshift - a scriptable metric processor
// Copyright Starshift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./tag_view_test.rs"]
mod tag_view_test;

use super::marshal::{self, to_starlark_error};
use super::metric::{MetricRef, ViewError};
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
// TagView
//

// Dict-like wrapper over a metric's tags, string keys to string values. Iteration yields keys in
// host order and holds an iterator token on the shared cell; structural changes are rejected
// while any token is live.
#[derive(Debug, ProvidesStaticType, NoSerialize, Allocative)]
pub struct TagView {
  #[allocative(skip)]
  cell: MetricRef,
}

impl TagView {
  #[must_use]
  pub(super) fn new(cell: MetricRef) -> Self {
    Self { cell }
  }

  // Bulk insert used by update(). Keys and values are already marshalled; the structural check
  // happens before the first write so a failed call leaves the map untouched.
  fn update_entries(&self, entries: Vec<(String, String)>) -> Result<(), ViewError> {
    self.cell.try_with_mut(|m| {
      if entries.iter().any(|(key, _)| !m.tags().contains_key(key)) {
        self.cell.tags_guard.check_structural()?;
      }
      for (key, value) in entries {
        m.tags_mut().insert(key, value);
      }
      Ok(())
    })
  }
}

impl fmt::Display for TagView {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.cell.with(|m| {
      m.tags()
        .iter()
        .map(|(key, value)| format!("{key:?}: {value:?}"))
        .join(", ")
    }) {
      Ok(body) => write!(f, "{{{body}}}"),
      Err(_) => write!(f, "{{}}"),
    }
  }
}

unsafe impl<'v> Trace<'v> for TagView {
  fn trace(&mut self, _tracer: &Tracer<'v>) {}
}

impl<'v> AllocValue<'v> for TagView {
  fn alloc_value(self, heap: &'v Heap) -> Value<'v> {
    heap.alloc_complex_no_freeze(self)
  }
}

#[starlark_value(type = "Tags")]
impl<'v> StarlarkValue<'v> for TagView {
  fn get_methods() -> Option<&'static Methods> {
    static RES: MethodsStatic = MethodsStatic::new();
    RES.methods(tag_view_methods)
  }

  fn at(&self, index: Value<'v>, heap: &'v Heap) -> starlark::Result<Value<'v>> {
    index
      .unpack_str()
      .and_then(|key| {
        self
          .cell
          .with(|m| m.tags().get(key).map(|value| heap.alloc(value.as_str())))
          .ok()
          .flatten()
      })
      .ok_or_else(|| to_starlark_error(ViewError::KeyNotFound(index.to_str())))
  }

  fn set_at(&self, index: Value<'v>, new_value: Value<'v>) -> starlark::Result<()> {
    let key = marshal::tag_key_from_script(index).map_err(to_starlark_error)?;
    let value = marshal::tag_value_from_script(new_value).map_err(to_starlark_error)?;
    self
      .cell
      .try_with_mut(|m| {
        if !m.tags().contains_key(&key) {
          self.cell.tags_guard.check_structural()?;
        }
        m.tags_mut().insert(key, value);
        Ok(())
      })
      .map_err(to_starlark_error)
  }

  fn length(&self) -> starlark::Result<i32> {
    let len = self.cell.with(|m| m.tags().len()).map_err(to_starlark_error)?;
    Ok(len.try_into().unwrap_or(i32::MAX))
  }

  fn is_in(&self, other: Value<'v>) -> starlark::Result<bool> {
    Ok(other.unpack_str().is_some_and(|key| {
      self
        .cell
        .with(|m| m.tags().contains_key(key))
        .unwrap_or(false)
    }))
  }

  fn to_bool(&self) -> bool {
    self.cell.with(|m| !m.tags().is_empty()).unwrap_or(false)
  }

  unsafe fn iterate(&self, me: Value<'v>, _heap: &'v Heap) -> starlark::Result<Value<'v>> {
    self.cell.tags_guard.enter();
    Ok(me)
  }

  unsafe fn iter_size_hint(&self, index: usize) -> (usize, Option<usize>) {
    let remaining = self
      .cell
      .with(|m| m.tags().len())
      .unwrap_or(0)
      .saturating_sub(index);
    (remaining, Some(remaining))
  }

  unsafe fn iter_next(&self, index: usize, heap: &'v Heap) -> Option<Value<'v>> {
    self
      .cell
      .with(|m| m.tags().get_index(index).map(|(key, _)| heap.alloc(key.as_str())))
      .ok()
      .flatten()
  }

  unsafe fn iter_stop(&self) {
    self.cell.tags_guard.exit();
  }
}

fn expect_tag_view<'v>(value: Value<'v>) -> anyhow::Result<&'v TagView> {
  value
    .downcast_ref::<TagView>()
    .ok_or_else(|| anyhow!("expected a tag view receiver, got '{}'", value.get_type()))
}

#[starlark_module]
fn tag_view_methods(builder: &mut MethodsBuilder) {
  fn clear<'v>(this: Value<'v>) -> anyhow::Result<NoneType> {
    let view = expect_tag_view(this)?;
    view.cell.tags_guard.check_structural()?;
    view.cell.with_mut(|m| m.tags_mut().clear())?;
    Ok(NoneType)
  }

  fn get<'v>(
    this: Value<'v>,
    #[starlark(require = pos)] key: Value<'v>,
    #[starlark(require = pos)] default: Option<Value<'v>>,
    heap: &'v Heap,
  ) -> anyhow::Result<Value<'v>> {
    let view = expect_tag_view(this)?;
    let found = match key.unpack_str() {
      Some(key) => view
        .cell
        .with(|m| m.tags().get(key).map(|value| heap.alloc(value.as_str())))?,
      None => None,
    };
    Ok(found.or(default).unwrap_or_else(|| Value::new_none()))
  }

  fn items<'v>(this: Value<'v>, heap: &'v Heap) -> anyhow::Result<Value<'v>> {
    let view = expect_tag_view(this)?;
    let items = view.cell.with(|m| {
      m.tags()
        .iter()
        .map(|(key, value)| heap.alloc((key.as_str(), value.as_str())))
        .collect::<Vec<_>>()
    })?;
    Ok(heap.alloc(AllocList(items)))
  }

  fn keys<'v>(this: Value<'v>, heap: &'v Heap) -> anyhow::Result<Value<'v>> {
    let view = expect_tag_view(this)?;
    let keys = view.cell.with(|m| {
      m.tags()
        .keys()
        .map(|key| heap.alloc(key.as_str()))
        .collect::<Vec<_>>()
    })?;
    Ok(heap.alloc(AllocList(keys)))
  }

  fn values<'v>(this: Value<'v>, heap: &'v Heap) -> anyhow::Result<Value<'v>> {
    let view = expect_tag_view(this)?;
    let values = view.cell.with(|m| {
      m.tags()
        .values()
        .map(|value| heap.alloc(value.as_str()))
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
    let view = expect_tag_view(this)?;
    if let Some(key) = key.unpack_str() {
      if view.cell.with(|m| m.tags().contains_key(key))? {
        view.cell.tags_guard.check_structural()?;
        if let Some(value) = view.cell.with_mut(|m| m.tags_mut().shift_remove(key))? {
          return Ok(heap.alloc(value));
        }
      }
    }
    default.map_or_else(|| Err(ViewError::KeyNotFound(key.to_str()).into()), Ok)
  }

  fn popitem<'v>(this: Value<'v>, heap: &'v Heap) -> anyhow::Result<Value<'v>> {
    let view = expect_tag_view(this)?;
    view.cell.tags_guard.check_structural()?;
    let (key, value) = view
      .cell
      .try_with_mut(|m| m.tags_mut().shift_remove_index(0).ok_or(ViewError::EmptyDict))?;
    Ok(heap.alloc((key, value)))
  }

  fn setdefault<'v>(
    this: Value<'v>,
    #[starlark(require = pos)] key: Value<'v>,
    #[starlark(require = pos)] default: Option<Value<'v>>,
    heap: &'v Heap,
  ) -> anyhow::Result<Value<'v>> {
    let view = expect_tag_view(this)?;
    let key = marshal::tag_key_from_script(key)?;
    if let Some(existing) = view
      .cell
      .with(|m| m.tags().get(&key).map(|value| heap.alloc(value.as_str())))?
    {
      return Ok(existing);
    }
    let default = default.unwrap_or_else(|| Value::new_none());
    let value = marshal::tag_value_from_script(default)?;
    view.cell.tags_guard.check_structural()?;
    view.cell.with_mut(|m| m.tags_mut().insert(key, value))?;
    Ok(default)
  }

  fn update<'v>(
    this: Value<'v>,
    #[starlark(require = pos)] pairs: Option<Value<'v>>,
    #[starlark(kwargs)] kwargs: SmallMap<String, Value<'v>>,
  ) -> anyhow::Result<NoneType> {
    let view = expect_tag_view(this)?;
    let mut entries = Vec::new();
    if let Some(pairs) = pairs {
      for (key, value) in marshal::update_pairs(pairs)? {
        entries.push((
          marshal::tag_key_from_script(key)?,
          marshal::tag_value_from_script(value)?,
        ));
      }
    }
    for (key, value) in kwargs {
      entries.push((key, marshal::tag_value_from_script(value)?));
    }
    view.update_entries(entries)?;
    Ok(NoneType)
  }
}
