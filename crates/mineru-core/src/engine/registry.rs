//! Engine registry -- a named collection of available parsing backends.
//!
//! The registry allows the worker runtime to look up an engine by the
//! `backend` a task was submitted with.

use std::collections::HashMap;

use super::trait_def::EngineAdapter;

/// A collection of registered [`EngineAdapter`] implementations, keyed by
/// name.
///
/// # Example
///
/// ```ignore
/// let mut registry = EngineRegistry::new();
/// registry.register(ProcessEngineAdapter::new("default", cmd_template));
/// let engine = registry.get("default").unwrap();
/// ```
#[derive(Default)]
pub struct EngineRegistry {
    engines: HashMap<String, Box<dyn EngineAdapter>>,
}

impl EngineRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an engine adapter.
    ///
    /// The engine is stored under the name returned by
    /// [`EngineAdapter::name`]. If an engine with the same name is
    /// already registered, it is replaced and the old one is returned.
    pub fn register(
        &mut self,
        engine: impl EngineAdapter + 'static,
    ) -> Option<Box<dyn EngineAdapter>> {
        let name = engine.name().to_string();
        self.engines.insert(name, Box::new(engine))
    }

    /// Look up an engine by backend name.
    pub fn get(&self, name: &str) -> Option<&dyn EngineAdapter> {
        self.engines.get(name).map(|b| b.as_ref())
    }

    /// List the names of all registered engines.
    ///
    /// The order is not guaranteed (HashMap iteration order).
    pub fn list(&self) -> Vec<&str> {
        self.engines.keys().map(|s| s.as_str()).collect()
    }

    /// Return the number of registered engines.
    pub fn len(&self) -> usize {
        self.engines.len()
    }

    /// Return `true` if no engines are registered.
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines", &self.engines.keys().collect::<Vec<_>>())
            .finish()
    }
}
