// starshift - a scriptable metric processor
// Copyright Starshift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use prometheus::{IntCounter, Opts, Registry};

//
// Collector
//

// Owns the registry that every pipeline component registers its stats into.
#[derive(Clone, Default)]
pub struct Collector {
  registry: Registry,
}

impl Collector {
  #[must_use]
  pub fn scope(&self, name: &str) -> Scope {
    Scope {
      registry: self.registry.clone(),
      prefix: name.to_string(),
    }
  }

  #[must_use]
  pub const fn registry(&self) -> &Registry {
    &self.registry
  }
}

//
// Scope
//

// A named stats namespace. Nested scopes join their prefixes with ':', so a counter "drop_error"
// created under scope "processor" is exported as "processor:drop_error".
#[derive(Clone)]
pub struct Scope {
  registry: Registry,
  prefix: String,
}

impl Scope {
  #[must_use]
  pub fn scope(&self, name: &str) -> Self {
    Self {
      registry: self.registry.clone(),
      prefix: format!("{}:{name}", self.prefix),
    }
  }

  // Duplicate registration of the same fully-scoped name is a programming error.
  #[must_use]
  pub fn counter(&self, name: &str) -> IntCounter {
    let counter = IntCounter::with_opts(Opts::new(
      format!("{}:{name}", self.prefix),
      format!("{} {name}", self.prefix),
    ))
    .unwrap();
    self.registry.register(Box::new(counter.clone())).unwrap();
    counter
  }
}
