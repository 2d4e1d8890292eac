use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::Producer;

/// Errors returned when registering a producer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Producer's key cannot be blank")]
    BlankKey,

    #[error("Another Producer with key {0} is already registered")]
    Duplicate(String),
}

/// Producers keyed by the first URL segment they answer to.
///
/// Filled once at startup and looked up per request.
#[derive(Default)]
pub struct Registry {
    producers: Mutex<HashMap<String, Arc<dyn Producer>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `producer` to `key`, which must be unique and not blank.
    pub fn add_producer(&self, key: &str, producer: Arc<dyn Producer>) -> Result<(), RegistryError> {
        if key.trim().is_empty() {
            return Err(RegistryError::BlankKey);
        }

        let mut producers = self.producers.lock().unwrap_or_else(PoisonError::into_inner);
        if producers.contains_key(key) {
            return Err(RegistryError::Duplicate(key.to_string()));
        }
        producers.insert(key.to_string(), producer);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Producer>> {
        self.producers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}
