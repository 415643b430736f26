use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use wb_core::{ScopedStorage, StorageError};

/// Process-local scoped store; values vanish with the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryScopedStore {
    values: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl MemoryScopedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(&self, key: impl Into<String>) -> MemoryScope {
        MemoryScope {
            values: Arc::clone(&self.values),
            key: key.into(),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.values
            .lock()
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct MemoryScope {
    values: Arc<Mutex<BTreeMap<String, Value>>>,
    key: String,
}

impl MemoryScope {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Value>>, StorageError> {
        self.values
            .lock()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))
    }
}

impl ScopedStorage for MemoryScope {
    fn scope(&self) -> &str {
        &self.key
    }

    fn get_value(&self) -> Result<Option<Value>, StorageError> {
        Ok(self.lock()?.get(&self.key).cloned())
    }

    fn set_value(&self, value: &Value) -> Result<(), StorageError> {
        self.lock()?.insert(self.key.clone(), value.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.lock()?.remove(&self.key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wb_core::ScopedStorageExt;

    #[test]
    fn scopes_share_backing_map() {
        let store = MemoryScopedStore::new();
        let first = store.scope("tabs");
        let second = store.scope("tabs");

        first.set(&vec![1, 2, 3]).expect("set");
        assert_eq!(second.get::<Vec<u32>>().expect("get"), Some(vec![1, 2, 3]));
        assert_eq!(store.keys(), vec!["tabs".to_string()]);

        second.clear().expect("clear");
        assert_eq!(first.get::<Vec<u32>>().expect("get"), None);
    }
}
