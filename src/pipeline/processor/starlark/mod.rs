// starshift - a scriptable metric processor
// Copyright Starshift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


use super::{PipelineProcessor, ProcessorFactoryContext};
use crate::metric::Metric;
use crate::pipeline::{DropHook, PipelineDispatch};
use crate::starlark::{ApplyOutcome, ProgramWrapper};
use crate::stats::Scope;
use async_trait::async_trait;
use parking_lot::Mutex;
use prometheus::IntCounter;
use serde::Deserialize;
use std::sync::Arc;

//
// OnError
//

// What happens to the input metric when an invocation fails. Only dropping is recognized;
// anything else is rejected when the configuration is parsed.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
  #[default]
  Drop,
}

//
// StarlarkProcessorConfig
//

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StarlarkProcessorConfig {
  // The script. Must bind apply(metric).
  pub source: String,
  #[serde(default)]
  pub on_error: OnError,
}

//
// StarlarkStats
//

struct StarlarkStats {
  drop_error: IntCounter,
  drop_none: IntCounter,
}

impl StarlarkStats {
  fn new(scope: &Scope) -> Self {
    Self {
      drop_error: scope.counter("drop_error"),
      drop_none: scope.counter("drop_none"),
    }
  }
}

//
// StarlarkProcessor
//

/// A processor that runs a user supplied Starlark program against every metric and emits
/// whatever the program returns. The program is compiled and its module scope frozen once, at
/// configuration time.
pub struct StarlarkProcessor {
  // The compiled program itself is immutable; the lock serializes invocations so there is one
  // in-flight call no matter how many workers the pipeline runs.
  program: Mutex<ProgramWrapper>,
  dispatcher: Arc<dyn PipelineDispatch>,
  drop_hook: Arc<dyn DropHook>,
  on_error: OnError,
  stats: StarlarkStats,
}

impl StarlarkProcessor {
  pub fn new(
    config: &StarlarkProcessorConfig,
    context: ProcessorFactoryContext,
  ) -> anyhow::Result<Self> {
    Ok(Self {
      program: Mutex::new(ProgramWrapper::new(&config.source)?),
      dispatcher: context.dispatcher,
      drop_hook: context.drop_hook,
      on_error: config.on_error,
      stats: StarlarkStats::new(&context.scope),
    })
  }
}

#[async_trait]
impl PipelineProcessor for StarlarkProcessor {
  async fn recv_samples(self: Arc<Self>, samples: Vec<Metric>) {
    let mut emitted = Vec::new();
    for sample in samples {
      let ApplyOutcome {
        emitted: mut produced,
        released,
        error,
      } = self.program.lock().run_with_metric(sample);

      if let Some(error) = error {
        debug_assert!(produced.is_empty());
        match self.on_error {
          OnError::Drop => {
            log::warn!("metric dropped due to script error: {error}");
            self.stats.drop_error.inc();
          },
        }
      } else if produced.is_empty() {
        self.stats.drop_none.inc();
      }

      emitted.append(&mut produced);
      for metric in released {
        self.drop_hook.release(metric);
      }
    }

    if !emitted.is_empty() {
      self.dispatcher.send(emitted).await;
    }
  }

  async fn start(self: Arc<Self>) {}
}
