//! User callback trait and the name-to-factory registry.
//!
//! Requests carry a callback *name*, never an object: the class is resolved
//! only when the callback job runs, which keeps job arguments serializable
//! and avoids cross-process object identity.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::types::{ErrorValue, Response};

/// Completion handler invoked on an ordinary job worker once a request
/// terminates.
///
/// Implement whichever side matters; the default for the other is a no-op.
pub trait Callback: Send + Sync {
    fn on_complete(&self, response: Response) {
        let _ = response;
    }

    fn on_error(&self, error: ErrorValue) {
        let _ = error;
    }
}

type CallbackFactory = Arc<dyn Fn() -> Box<dyn Callback> + Send + Sync>;

/// Maps callback class names to factories.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    factories: HashMap<String, CallbackFactory>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Callback> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Instantiates the callback registered under `name`.
    pub fn resolve(&self, name: &str) -> Option<Box<dyn Callback>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("classes", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
