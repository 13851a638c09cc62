//! In-process register
//!
//! Clones share the same values, so several managers in one process (or
//! one test) can act as separate devices over one register.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;

use super::{IdentityRegister, CHANGE_CHANNEL_CAPACITY};
use crate::error::StoreResult;

#[derive(Clone)]
pub struct MemoryRegister {
    inner: Arc<Inner>,
}

struct Inner {
    values: Mutex<HashMap<String, String>>,
    changes: broadcast::Sender<String>,
}

impl MemoryRegister {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                values: Mutex::new(HashMap::new()),
                changes,
            }),
        }
    }

    fn update(&self, key: &str, value: Option<&str>) {
        let changed = {
            let mut values = self
                .inner
                .values
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let previous = match value {
                Some(value) => values.insert(key.to_string(), value.to_string()),
                None => values.remove(key),
            };
            previous.as_deref() != value
        };

        if changed {
            let _ = self.inner.changes.send(key.to_string());
        }
    }
}

impl Default for MemoryRegister {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityRegister for MemoryRegister {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let values = self
            .inner
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.update(key, Some(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.update(key, None);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.inner.changes.subscribe()
    }

    fn synchronize(&self) -> StoreResult<bool> {
        Ok(false)
    }
}
