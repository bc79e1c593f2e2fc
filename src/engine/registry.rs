//! Lookup table from stable names to handler instances.
//!
//! Populated exactly once during startup and read-only for the rest of the
//! process lifetime; no synchronization is needed after the populate phase
//! because no writer exists concurrently with readers. Share via `Arc`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::errors::EngineError;

use super::handler::PhaseHandler;

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn PhaseHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler under a unique name. Rebinding an existing name is a
    /// startup bug, not a policy — silent overwrite would hide it.
    pub fn register(
        &mut self,
        name: &str,
        handler: Arc<dyn PhaseHandler>,
    ) -> Result<(), EngineError> {
        if self.handlers.contains_key(name) {
            return Err(EngineError::DuplicateHandler {
                name: name.to_string(),
            });
        }
        self.handlers.insert(name.to_string(), handler);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn PhaseHandler>, EngineError> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownHandler {
                name: name.to_string(),
            })
    }

    /// All registered names, sorted. Introspection and tests only.
    pub fn names(&self) -> BTreeSet<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
