//! Function Registry
//!
//! Task bodies are looked up by key instead of being serialized. The registry
//! is code, not data: the scheduling process and every runner process build
//! the same registry, so a key written into a payload by one resolves to the
//! same function in the other.
//!
//! ```rust
//! use jobgraph::registry::Registry;
//! use jobgraph::Value;
//!
//! let registry = Registry::new("etl").register("double", |args, _kwargs| {
//!     let n = args.first().and_then(Value::as_i64).unwrap_or(0);
//!     Ok(Value::Int(n * 2))
//! });
//!
//! assert!(registry.contains("double"));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::BoxError;
use crate::value::{Kwargs, Value};

/// Name of the registry used when none is given.
pub const DEFAULT_REGISTRY: &str = "default";

/// Signature every registered function implements.
pub type TaskFn = Arc<dyn Fn(Vec<Value>, Kwargs) -> Result<Value, BoxError> + Send + Sync>;

/// Maps function keys to implementations.
#[derive(Clone)]
pub struct Registry {
    name: String,
    functions: HashMap<String, TaskFn>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: HashMap::new(),
        }
    }

    /// Registers `f` under `key`, replacing any previous entry.
    pub fn register<F>(mut self, key: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>, Kwargs) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.functions.insert(key.into(), Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&TaskFn> {
        self.functions.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.functions.contains_key(key)
    }

    /// Sorted function keys.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("name", &self.name)
            .field("functions", &self.keys())
            .finish()
    }
}
