//! Thread-safe snapshot of the most recently observed node payload.

use std::sync::RwLock;

use serde_json::{Map, Value};

/// `None` until the first successful read or write.
pub struct Cache {
    inner: RwLock<Option<Loaded>>,
}

struct Loaded {
    map: Map<String, Value>,
    /// Node version the map was decoded from; `None` if the node was absent.
    version: Option<i32>,
}

impl Cache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    /// Stores `map` as observed at `version`. Returns false if the cache
    /// already held that exact version.
    pub fn replace(&self, map: Map<String, Value>, version: Option<i32>) -> bool {
        let Ok(mut guard) = self.inner.write() else {
            return true;
        };
        let changed = guard.as_ref().is_none_or(|loaded| loaded.version != version);
        *guard = Some(Loaded { map, version });
        changed
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().ok()?.as_ref()?.map.get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner
            .read()
            .map(|g| g.as_ref().is_some_and(|loaded| loaded.map.contains_key(key)))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .map(|g| g.as_ref().map_or(0, |loaded| loaded.map.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.read().map(|g| g.is_some()).unwrap_or(false)
    }

    /// Copy of the current contents; empty if nothing was loaded yet.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.inner
            .read()
            .ok()
            .and_then(|g| g.as_ref().map(|loaded| loaded.map.clone()))
            .unwrap_or_default()
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}
