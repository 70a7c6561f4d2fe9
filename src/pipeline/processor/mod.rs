// starshift - a scriptable metric processor
// Copyright Starshift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use self::starlark::StarlarkProcessor;
use super::{DropHook, PipelineDispatch};
use crate::metric::Metric;
use crate::stats::Scope;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

pub mod starlark;

//
// PipelineProcessor
//

#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait PipelineProcessor {
  /// Receive samples from the pipeline dispatch loop. Surviving samples are sent back through
  /// the processor's dispatcher; consumed samples go through the drop hook.
  async fn recv_samples(self: Arc<Self>, samples: Vec<Metric>);

  /// Called after the entire pipeline is created.
  async fn start(self: Arc<Self>);
}

pub type DynamicPipelineProcessor = Arc<dyn PipelineProcessor + Send + Sync + 'static>;

//
// ProcessorConfig
//

// Typed processor configuration, one variant per processor implementation. Unknown processor
// types and unknown per-processor options fail deserialization.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorConfig {
  Starlark(starlark::StarlarkProcessorConfig),
}

pub fn config_from_yaml(contents: &str) -> anyhow::Result<ProcessorConfig> {
  Ok(serde_yaml::from_str(contents)?)
}

//
// ProcessorFactoryContext
//

pub struct ProcessorFactoryContext {
  pub name: String,
  pub scope: Scope,
  pub dispatcher: Arc<dyn PipelineDispatch>,
  pub drop_hook: Arc<dyn DropHook>,
}

pub fn to_processor(
  config: ProcessorConfig,
  context: ProcessorFactoryContext,
) -> anyhow::Result<DynamicPipelineProcessor> {
  match config {
    ProcessorConfig::Starlark(config) => Ok(Arc::new(StarlarkProcessor::new(&config, context)?)),
  }
}
