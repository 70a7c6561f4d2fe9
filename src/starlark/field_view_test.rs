// starshift - a scriptable metric processor
// Copyright Starshift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::metric::FieldValue;
use crate::starlark::metric::{MetricCell, MetricRef, ViewError};
use crate::test::make_metric;
use assert_matches::assert_matches;
use pretty_assertions::assert_eq;

fn make_view(fields: &[(&str, FieldValue)]) -> (MetricRef, FieldView) {
  let cell = MetricCell::wrap(make_metric("cpu", &[], fields, 0));
  let view = FieldView::new(cell.clone());
  (cell, view)
}

#[test]
fn update_entries_preserves_value_variants() {
  let (cell, view) = make_view(&[("time_idle", FieldValue::F64(42.0))]);
  view
    .update_entries(vec![
      ("count".to_string(), FieldValue::U64(u64::MAX)),
      ("up".to_string(), FieldValue::Bool(true)),
    ])
    .unwrap();
  cell
    .with(|m| {
      assert_eq!(Some(&FieldValue::F64(42.0)), m.fields().get("time_idle"));
      assert_eq!(Some(&FieldValue::U64(u64::MAX)), m.fields().get("count"));
      assert_eq!(Some(&FieldValue::Bool(true)), m.fields().get("up"));
    })
    .unwrap();
}

#[test]
fn update_entries_is_atomic_under_iteration() {
  let (cell, view) = make_view(&[("time_idle", FieldValue::F64(42.0))]);
  cell.fields_guard.enter();

  let result = view.update_entries(vec![
    ("time_idle".to_string(), FieldValue::F64(0.0)),
    ("time_user".to_string(), FieldValue::F64(1.0)),
  ]);
  assert_matches!(result, Err(ViewError::MutateWhileIterating));
  cell
    .with(|m| {
      assert_eq!(1, m.fields().len());
      assert_eq!(Some(&FieldValue::F64(42.0)), m.fields().get("time_idle"));
    })
    .unwrap();

  view
    .update_entries(vec![("time_idle".to_string(), FieldValue::I64(7))])
    .unwrap();
  cell
    .with(|m| assert_eq!(Some(&FieldValue::I64(7)), m.fields().get("time_idle")))
    .unwrap();

  cell.fields_guard.exit();
}

#[test]
fn iterating_fields_does_not_guard_tags() {
  let (cell, view) = make_view(&[("time_idle", FieldValue::F64(42.0))]);
  cell.fields_guard.enter();
  assert!(cell.tags_guard.check_structural().is_ok());
  assert_matches!(
    view.update_entries(vec![("new".to_string(), FieldValue::I64(1))]),
    Err(ViewError::MutateWhileIterating)
  );
  cell.fields_guard.exit();
}
