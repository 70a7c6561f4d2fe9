// starshift - a scriptable metric processor
// Copyright Starshift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./metric_test.rs"]
mod metric_test;

use indexmap::IndexMap;
use std::fmt::Display;
use time::OffsetDateTime;

//
// FieldValue
//

// Wraps a single field sample across the supported telemetry value types. These are the only
// variants a script is allowed to write back into a metric.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
  String(String),
  I64(i64),
  U64(u64),
  F64(f64),
  Bool(bool),
}

impl FieldValue {
  #[must_use]
  pub const fn type_name(&self) -> &'static str {
    match self {
      Self::String(_) => "string",
      Self::I64(_) => "int64",
      Self::U64(_) => "uint64",
      Self::F64(_) => "float64",
      Self::Bool(_) => "bool",
    }
  }
}

impl Display for FieldValue {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::String(s) => write!(f, "{s:?}"),
      Self::I64(i) => write!(f, "{i}"),
      Self::U64(u) => write!(f, "{u}"),
      Self::F64(v) => write!(f, "{v}"),
      Self::Bool(b) => write!(f, "{b}"),
    }
  }
}

impl From<&str> for FieldValue {
  fn from(value: &str) -> Self {
    Self::String(value.to_string())
  }
}

impl From<i64> for FieldValue {
  fn from(value: i64) -> Self {
    Self::I64(value)
  }
}

impl From<u64> for FieldValue {
  fn from(value: u64) -> Self {
    Self::U64(value)
  }
}

impl From<f64> for FieldValue {
  fn from(value: f64) -> Self {
    Self::F64(value)
  }
}

impl From<bool> for FieldValue {
  fn from(value: bool) -> Self {
    Self::Bool(value)
  }
}

//
// Metric
//

// A metric sample: measurement name, tags, fields, and a nanosecond timestamp. Tags and fields
// keep insertion order, which is the iteration order scripts observe; replacing the value of an
// existing key does not move it.
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
  name: String,
  tags: IndexMap<String, String>,
  fields: IndexMap<String, FieldValue>,
  timestamp: i64,
}

impl Metric {
  #[must_use]
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      tags: IndexMap::new(),
      fields: IndexMap::new(),
      timestamp: 0,
    }
  }

  #[must_use]
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn set_name(&mut self, name: String) {
    self.name = name;
  }

  // Nanoseconds since the Unix epoch.
  #[must_use]
  pub const fn timestamp(&self) -> i64 {
    self.timestamp
  }

  pub fn set_timestamp(&mut self, timestamp: i64) {
    self.timestamp = timestamp;
  }

  #[must_use]
  pub const fn tags(&self) -> &IndexMap<String, String> {
    &self.tags
  }

  pub fn tags_mut(&mut self) -> &mut IndexMap<String, String> {
    &mut self.tags
  }

  #[must_use]
  pub const fn fields(&self) -> &IndexMap<String, FieldValue> {
    &self.fields
  }

  pub fn fields_mut(&mut self) -> &mut IndexMap<String, FieldValue> {
    &mut self.fields
  }

  pub fn to_datetime(&self) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.timestamp)).ok()
  }
}

impl Display for Metric {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}(", self.name)?;
    for (tag, value) in &self.tags {
      write!(f, "[{tag}={value}]")?;
    }
    write!(f, ")(")?;
    for (field, value) in &self.fields {
      write!(f, "[{field}={value}]")?;
    }
    write!(f, ")[TIMESTAMP={}]", self.timestamp)
  }
}
