use crate::storage::KeyValueStore;
use dashmap::DashMap;
use std::convert::Infallible;
use std::sync::Arc;

/// A [KeyValueStore] held in a [DashMap](dashmap::DashMap).
///
/// Keys are enumerated in lexicographic order, so eviction ties resolve the same way on every
/// run.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    map: Arc<DashMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl KeyValueStore for InMemoryStore {
    type Error = Infallible;

    async fn list_keys(&self) -> Result<Vec<String>, Self::Error> {
        let mut keys: Vec<String> = self.map.iter().map(|e| e.key().clone()).collect();
        keys.sort_unstable();
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Self::Error> {
        Ok(self.map.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), Self::Error> {
        self.map.insert(key.to_owned(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), Self::Error> {
        self.map.remove(key);
        Ok(())
    }
}
