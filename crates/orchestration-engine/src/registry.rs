//! Type registries for dynamic dispatch
//!
//! Facilitators, advisers and steps are looked up by a closed key
//! (`FacilitatorType`, `AdviserType`) or a step type name. Registries are
//! explicit instances built once at engine start and handed to the
//! components that need them; there is no global registry.
//!
//! ```ignore
//! let mut advisers: Registry<AdviserType, dyn Adviser> = Registry::new("adviser");
//! advisers.register(AdviserType::Retry, Arc::new(RetryAdviser))?;
//! let retry = advisers.obtain(&AdviserType::Retry)?;
//! ```

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;

use crate::error::{EngineError, Result};

/// Map from a registry key to a shared implementation
pub struct Registry<K, V: ?Sized> {
    kind: &'static str,
    entries: HashMap<K, Arc<V>>,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone + Display,
    V: ?Sized,
{
    /// Create an empty registry; `kind` names it in error messages
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
        }
    }

    /// Register an implementation. Registering a key twice is an error.
    pub fn register(&mut self, key: K, value: Arc<V>) -> Result<()> {
        if self.entries.contains_key(&key) {
            return Err(EngineError::DuplicateRegistration {
                registry: self.kind,
                key: key.to_string(),
            });
        }
        log::debug!("Registered {} '{}'", self.kind, key);
        self.entries.insert(key, value);
        Ok(())
    }

    /// Look up an implementation
    pub fn obtain(&self, key: &K) -> Result<Arc<V>> {
        self.entries
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::UnregisteredKey {
                registry: self.kind,
                key: key.to_string(),
            })
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered keys (unordered)
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }
}
