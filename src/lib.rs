// starshift - a scriptable metric processor
// Copyright Starshift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod metric;
pub mod pipeline;
pub mod starlark;
pub mod stats;
pub mod test;
