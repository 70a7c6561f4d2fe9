// starshift - a scriptable metric processor
// Copyright Starshift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::metric::Metric;
use async_trait::async_trait;
use mockall::automock;

pub mod processor;

//
// PipelineDispatch
//

// Downstream hand-off for metrics a processor emits. Implemented by the enclosing pipeline.
#[automock]
#[async_trait]
pub trait PipelineDispatch: Send + Sync {
  async fn send(&self, samples: Vec<Metric>);
}

//
// DropHook
//

// The pipeline's drop path. Every metric handed to a processor that is not emitted must be
// returned through here so the pipeline can account for it.
#[automock]
pub trait DropHook: Send + Sync {
  fn release(&self, sample: Metric);
}
