// starshift - a scriptable metric processor
// Copyright Starshift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./marshal_test.rs"]
mod marshal_test;

use crate::metric::FieldValue;
use anyhow::bail;
use itertools::Itertools;
use starlark::values::dict::DictRef;
use starlark::values::float::StarlarkFloat;
use starlark::values::list::ListRef;
use starlark::values::tuple::TupleRef;
use starlark::values::{Heap, UnpackValue, Value, ValueLike};
use std::fmt;
use thiserror::Error;

//
// MarshalError
//

// Rejected conversions between script values and host values. Each of these aborts the current
// apply() invocation when it reaches the script.
#[derive(Error, Debug, Eq, PartialEq)]
pub enum MarshalError {
  #[error("metric name must be of type 'str', got '{0}'")]
  InvalidName(&'static str),
  #[error("metric time must be of type 'int', got '{0}'")]
  InvalidTime(&'static str),
  #[error("metric time does not fit in 64 signed bits")]
  TimeOutOfRange,
  #[error("tag key must be of type 'str', got '{0}'")]
  InvalidTagKey(&'static str),
  #[error("tag value must be of type 'str', got '{0}'")]
  InvalidTagValue(&'static str),
  #[error("field key must be of type 'str', got '{0}'")]
  InvalidFieldKey(&'static str),
  #[error("field value must be of type 'str', 'int', 'float' or 'bool', got '{0}'")]
  InvalidFieldValue(&'static str),
  #[error("integer field value does not fit in 64 bits")]
  FieldIntOutOfRange,
}

// Adapter for surfacing bridge errors out of StarlarkValue trait methods.
pub(crate) fn to_starlark_error(error: impl Into<anyhow::Error>) -> starlark::Error {
  starlark::Error::new_other(AnyhowAsStdError(error.into()))
}

// starlark::Error::new_other requires std::error::Error, which anyhow::Error deliberately does
// not implement (to preserve downcasting). This forwards Display/source unchanged.
#[derive(Debug)]
struct AnyhowAsStdError(anyhow::Error);

impl fmt::Display for AnyhowAsStdError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(&self.0, f)
  }
}

impl std::error::Error for AnyhowAsStdError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    self.0.source()
  }
}

// The script observes a single arbitrary-precision integer type. Signedness of the host variant
// is chosen by magnitude on write-back; anything beyond the unsigned 64-bit range is rejected.
pub fn field_value_from_script(value: Value<'_>) -> Result<FieldValue, MarshalError> {
  if let Some(s) = value.unpack_str() {
    return Ok(FieldValue::String(s.to_string()));
  }
  if let Some(b) = value.unpack_bool() {
    return Ok(FieldValue::Bool(b));
  }
  if value.get_type() == "int" {
    if let Some(i) = i64::unpack_value(value) {
      return Ok(FieldValue::I64(i));
    }
    if let Some(u) = u64::unpack_value(value) {
      return Ok(FieldValue::U64(u));
    }
    return Err(MarshalError::FieldIntOutOfRange);
  }
  if let Some(f) = value.downcast_ref::<StarlarkFloat>() {
    return Ok(FieldValue::F64(f.0));
  }
  Err(MarshalError::InvalidFieldValue(value.get_type()))
}

pub fn field_value_to_script<'v>(value: &FieldValue, heap: &'v Heap) -> Value<'v> {
  match value {
    FieldValue::String(s) => heap.alloc(s.as_str()),
    FieldValue::I64(i) => heap.alloc(*i),
    FieldValue::U64(u) => heap.alloc(*u),
    FieldValue::F64(f) => heap.alloc(*f),
    FieldValue::Bool(b) => Value::new_bool(*b),
  }
}

pub fn tag_value_from_script(value: Value<'_>) -> Result<String, MarshalError> {
  value
    .unpack_str()
    .map(str::to_string)
    .ok_or_else(|| MarshalError::InvalidTagValue(value.get_type()))
}

pub fn tag_key_from_script(value: Value<'_>) -> Result<String, MarshalError> {
  value
    .unpack_str()
    .map(str::to_string)
    .ok_or_else(|| MarshalError::InvalidTagKey(value.get_type()))
}

pub fn field_key_from_script(value: Value<'_>) -> Result<String, MarshalError> {
  value
    .unpack_str()
    .map(str::to_string)
    .ok_or_else(|| MarshalError::InvalidFieldKey(value.get_type()))
}

// Assignment rewrites the host timestamp exactly, no unit normalization.
pub fn timestamp_from_script(value: Value<'_>) -> Result<i64, MarshalError> {
  if value.get_type() != "int" {
    return Err(MarshalError::InvalidTime(value.get_type()));
  }
  i64::unpack_value(value).ok_or(MarshalError::TimeOutOfRange)
}

pub fn name_from_script(value: Value<'_>) -> Result<String, MarshalError> {
  value
    .unpack_str()
    .map(str::to_string)
    .ok_or_else(|| MarshalError::InvalidName(value.get_type()))
}

// The positional argument of a view's update(): either a dict or a sequence of key/value pairs.
// Keys and values come back unconverted; the caller marshals them for its value type.
pub fn update_pairs(value: Value<'_>) -> anyhow::Result<Vec<(Value<'_>, Value<'_>)>> {
  if let Some(dict) = DictRef::from_value(value) {
    return Ok(dict.iter().collect());
  }
  let Some(items) = ListRef::from_value(value)
    .map(|list| list.content())
    .or_else(|| TupleRef::from_value(value).map(|tuple| tuple.content()))
  else {
    bail!(
      "update argument must be a dict or a sequence of key/value pairs, got '{}'",
      value.get_type()
    );
  };
  items
    .iter()
    .map(|item| {
      let pair = TupleRef::from_value(*item)
        .map(|tuple| tuple.content())
        .or_else(|| ListRef::from_value(*item).map(|list| list.content()));
      match pair {
        Some([key, value]) => Ok((*key, *value)),
        _ => bail!(
          "update sequence elements must be key/value pairs, got '{}'",
          item.get_type()
        ),
      }
    })
    .try_collect()
}
