//! Registry of named pure computations for `Computed` variables.

use std::collections::HashMap;
use std::sync::Arc;

use roundtable_types::{EngineError, Result};
use serde_json::Value;

/// A pure function from named input values to an output value.
pub type Computation =
    Arc<dyn Fn(&HashMap<String, Value>) -> Result<Value> + Send + Sync>;

/// Named computation registry, populated at session-start by the host.
#[derive(Clone, Default)]
pub struct ComputationRegistry {
    computations: HashMap<String, Computation>,
}

impl ComputationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&HashMap<String, Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.computations.insert(name.into(), Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Result<&Computation> {
        self.computations
            .get(name)
            .ok_or_else(|| EngineError::UnknownComputation {
                name: name.to_string(),
            })
    }

    pub fn has(&self, name: &str) -> bool {
        self.computations.contains_key(name)
    }
}
