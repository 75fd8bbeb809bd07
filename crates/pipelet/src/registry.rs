//! Action registry - locally exposed operations the peer can invoke.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::error::HandlerError;

pub type ActionResult = Result<Value, HandlerError>;

/// Handler invoked synchronously by the dispatch loop with the request params.
pub type ActionHandler = Arc<dyn Fn(Vec<Value>) -> ActionResult + Send + Sync>;

#[derive(Default)]
pub struct ActionRegistry {
    actions: RwLock<HashMap<String, ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `name`.
    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> ActionResult + Send + Sync + 'static,
    {
        let name = name.into();
        let mut actions = self
            .actions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if actions.insert(name.clone(), Arc::new(handler)).is_some() {
            tracing::debug!(action = %name, "Replaced action handler");
        }
    }

    /// Look up a handler. The lock is released before the caller invokes it,
    /// so handlers may register further actions.
    pub fn get(&self, name: &str) -> Option<ActionHandler> {
        self.actions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }
}
