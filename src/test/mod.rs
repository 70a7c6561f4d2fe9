// starshift - a scriptable metric processor
// Copyright Starshift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::metric::{FieldValue, Metric};
use crate::pipeline::processor::ProcessorFactoryContext;
use crate::pipeline::{MockDropHook, MockPipelineDispatch};
use crate::stats::Collector;
use std::sync::Arc;

#[must_use]
pub fn make_metric(
  name: &str,
  tags: &[(&str, &str)],
  fields: &[(&str, FieldValue)],
  timestamp: i64,
) -> Metric {
  let mut metric = Metric::new(name);
  for (key, value) in tags {
    metric
      .tags_mut()
      .insert((*key).to_string(), (*value).to_string());
  }
  for (key, value) in fields {
    metric.fields_mut().insert((*key).to_string(), value.clone());
  }
  metric.set_timestamp(timestamp);
  metric
}

// Mutable access to a mock behind an Arc for configuring expectations. Expectations are always
// configured before the component under test runs, never concurrently with it.
#[allow(clippy::mut_from_ref, invalid_reference_casting)]
#[must_use]
pub fn make_mut<T>(arc: &Arc<T>) -> &mut T {
  unsafe { &mut *Arc::as_ptr(arc).cast_mut() }
}

pub fn assert_counter_eq(collector: &Collector, value: u64, name: &str) {
  let found = collector
    .registry()
    .gather()
    .iter()
    .find(|family| family.get_name() == name)
    .map(|family| family.get_metric()[0].get_counter().get_value());
  assert_eq!(Some(value as f64), found, "counter {name}");
}

//
// ProcessorFactoryContextHelper
//

pub struct ProcessorFactoryContextHelper {
  pub collector: Collector,
  pub dispatcher: Arc<MockPipelineDispatch>,
  pub drop_hook: Arc<MockDropHook>,
}

#[must_use]
pub fn processor_factory_context_for_test()
-> (ProcessorFactoryContextHelper, ProcessorFactoryContext) {
  let collector = Collector::default();
  let dispatcher = Arc::new(MockPipelineDispatch::new());
  let drop_hook = Arc::new(MockDropHook::new());
  let scope = collector.scope("processor");
  (
    ProcessorFactoryContextHelper {
      collector,
      dispatcher: dispatcher.clone(),
      drop_hook: drop_hook.clone(),
    },
    ProcessorFactoryContext {
      name: "test".to_string(),
      scope,
      dispatcher,
      drop_hook,
    },
  )
}
