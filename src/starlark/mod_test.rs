// starshift - a scriptable metric processor
// Copyright Starshift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::metric::FieldValue;
use crate::test::make_metric;
use assert_matches::assert_matches;
use pretty_assertions::assert_eq;

#[test]
fn init_rejects_empty_source() {
  assert!(ProgramWrapper::new("").is_err());
  assert!(ProgramWrapper::new("  \n\t").is_err());
}

#[test]
fn init_rejects_syntax_errors() {
  assert!(ProgramWrapper::new("for").is_err());
}

#[test]
fn init_rejects_missing_apply() {
  assert!(ProgramWrapper::new("x = 1").is_err());
}

#[test]
fn init_rejects_non_function_apply() {
  assert!(ProgramWrapper::new("apply = 42").is_err());
}

#[test]
fn init_rejects_wrong_arity() {
  assert!(ProgramWrapper::new("def apply():\n    pass").is_err());
  assert!(ProgramWrapper::new("def apply(metric, extra):\n    pass").is_err());
  assert!(ProgramWrapper::new("def apply(*args):\n    pass").is_err());
}

#[test]
fn init_accepts_unary_apply() {
  assert!(ProgramWrapper::new("def apply(metric):\n    pass").is_ok());
}

#[test]
fn init_error_during_module_evaluation() {
  // The top level runs exactly once at init; errors there are init errors, not per-metric ones.
  assert!(ProgramWrapper::new("fail('boom')\ndef apply(metric):\n    pass").is_err());
}

#[test]
fn passthrough_emits_the_input() {
  let program = ProgramWrapper::new("def apply(metric):\n    return metric").unwrap();
  let input = make_metric(
    "cpu",
    &[("host", "example.org")],
    &[("time_idle", FieldValue::F64(42.0))],
    7,
  );
  let outcome = program.run_with_metric(input.clone());
  assert!(outcome.error.is_none());
  assert_eq!(vec![input], outcome.emitted);
  assert!(outcome.released.is_empty());
}

#[test]
fn returning_none_releases_the_input() {
  let program = ProgramWrapper::new("def apply(metric):\n    return None").unwrap();
  let input = make_metric("cpu", &[], &[("time_idle", FieldValue::I64(42))], 0);
  let outcome = program.run_with_metric(input.clone());
  assert!(outcome.error.is_none());
  assert!(outcome.emitted.is_empty());
  assert_eq!(vec![input], outcome.released);
}

#[test]
fn returning_an_empty_list_releases_the_input() {
  let program = ProgramWrapper::new("def apply(metric):\n    return []").unwrap();
  let outcome = program.run_with_metric(make_metric("cpu", &[], &[], 0));
  assert!(outcome.error.is_none());
  assert!(outcome.emitted.is_empty());
  assert_eq!(1, outcome.released.len());
}

#[test]
fn returning_the_same_metric_twice_is_an_error() {
  let program = ProgramWrapper::new("def apply(metric):\n    return [metric, metric]").unwrap();
  let input = make_metric("cpu", &[], &[("time_idle", FieldValue::F64(42.0))], 0);
  let outcome = program.run_with_metric(input.clone());
  assert_matches!(outcome.error, Some(ApplyError::DuplicateReference));
  assert!(outcome.emitted.is_empty());
  assert_eq!(vec![input], outcome.released);
}

#[test]
fn deepcopy_breaks_aliasing() {
  let program =
    ProgramWrapper::new("def apply(metric):\n    return [metric, deepcopy(metric)]").unwrap();
  let input = make_metric("cpu", &[], &[("time_idle", FieldValue::F64(42.0))], 0);
  let outcome = program.run_with_metric(input.clone());
  assert!(outcome.error.is_none());
  assert_eq!(vec![input.clone(), input], outcome.emitted);
  assert!(outcome.released.is_empty());
}

#[test]
fn tuple_returns_are_sequences() {
  let program =
    ProgramWrapper::new("def apply(metric):\n    return (deepcopy(metric), metric)").unwrap();
  let input = make_metric("cpu", &[], &[], 0);
  let outcome = program.run_with_metric(input.clone());
  assert!(outcome.error.is_none());
  assert_eq!(vec![input.clone(), input], outcome.emitted);
  assert!(outcome.released.is_empty());
}

#[test]
fn invalid_return_type_is_an_error() {
  let program = ProgramWrapper::new("def apply(metric):\n    return 42").unwrap();
  let outcome = program.run_with_metric(make_metric("cpu", &[], &[], 0));
  assert_matches!(outcome.error, Some(ApplyError::InvalidReturn(ref t)) if t == "int");
  assert_eq!(1, outcome.released.len());
}

#[test]
fn invalid_element_in_returned_sequence_is_an_error() {
  let program = ProgramWrapper::new("def apply(metric):\n    return [metric, 'x']").unwrap();
  let outcome = program.run_with_metric(make_metric("cpu", &[], &[], 0));
  assert_matches!(outcome.error, Some(ApplyError::InvalidReturn(ref t)) if t == "string");
  assert!(outcome.emitted.is_empty());
  assert_eq!(1, outcome.released.len());
}

#[test]
fn replacing_the_input_releases_it() {
  let source = r"
def apply(metric):
    m = Metric('memory')
    m.fields['used'] = 1
    return m
";
  let program = ProgramWrapper::new(source).unwrap();
  let input = make_metric("cpu", &[], &[("time_idle", FieldValue::I64(0))], 3);
  let outcome = program.run_with_metric(input.clone());
  assert!(outcome.error.is_none());
  assert_eq!(
    vec![make_metric("memory", &[], &[("used", FieldValue::I64(1))], 0)],
    outcome.emitted
  );
  assert_eq!(vec![input], outcome.released);
}

#[test]
fn frozen_module_scope_rejects_writes() {
  let source = r"
cache = []

def apply(metric):
    cache.append(deepcopy(metric))
    return metric
";
  let program = ProgramWrapper::new(source).unwrap();
  let outcome = program.run_with_metric(make_metric("cpu", &[], &[], 0));
  assert_matches!(outcome.error, Some(ApplyError::Script(_)));
  assert!(outcome.emitted.is_empty());
  assert_eq!(1, outcome.released.len());
}

#[test]
fn frozen_module_scope_is_readable() {
  let source = r"
names = {'cpu': 'cpu2', 'mem': 'mem2'}

def apply(metric):
    metric.name = names[metric.name]
    return metric
";
  let program = ProgramWrapper::new(source).unwrap();
  let outcome = program.run_with_metric(make_metric("cpu", &[], &[], 0));
  assert!(outcome.error.is_none());
  assert_eq!(vec![make_metric("cpu2", &[], &[], 0)], outcome.emitted);
}

#[test]
fn script_errors_carry_the_interpreter_diagnostic() {
  let program = ProgramWrapper::new("def apply(metric):\n    return metric.tags['missing']")
    .unwrap();
  let outcome = program.run_with_metric(make_metric("cpu", &[], &[], 0));
  assert_matches!(outcome.error, Some(ApplyError::Script(ref message)) if message.contains("missing"));
}

#[test]
fn invocations_do_not_leak_state_between_metrics() {
  let program = ProgramWrapper::new("def apply(metric):\n    return metric").unwrap();
  for i in 0 .. 3 {
    let input = make_metric("cpu", &[], &[], i);
    let outcome = program.run_with_metric(input.clone());
    assert_eq!(vec![input], outcome.emitted);
  }
}
