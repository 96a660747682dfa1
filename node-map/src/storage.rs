//! String key-value facade over a [`DistributedHashtable`].

use std::sync::Arc;

use serde_json::Value;

use crate::coordinator::Coordinator;
use crate::error::Error;
use crate::hashtable::{DistributedHashtable, Options};

/// Stores every value in its string form.
#[derive(Clone, Debug)]
pub struct Storage {
    map: DistributedHashtable,
}

impl Storage {
    pub async fn new(
        coordinator: Arc<dyn Coordinator>,
        path: impl Into<String>,
        options: Options,
    ) -> Result<Self, Error> {
        let map = DistributedHashtable::new(coordinator, path, options).await?;
        Ok(Self { map })
    }

    /// Cached value for `key`. Values written by other clients that are not
    /// JSON strings come back as their JSON text.
    pub fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|value| match value {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }

    pub async fn set(&self, key: impl Into<String>, value: impl ToString) {
        self.map.set(key, Value::String(value.to_string())).await;
    }

    pub fn hashtable(&self) -> &DistributedHashtable {
        &self.map
    }
}

impl From<DistributedHashtable> for Storage {
    fn from(map: DistributedHashtable) -> Self {
        Self { map }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryEnsemble;
    use serde_json::json;

    #[tokio::test]
    async fn values_are_stored_as_strings() {
        let ensemble = MemoryEnsemble::new();
        let storage = Storage::new(Arc::new(ensemble.connect()), "/rollout", Options::new())
            .await
            .unwrap();

        assert_eq!(storage.get("feature:chat"), None);

        storage.set("feature:chat", 100).await;
        storage.set("feature:beta", true).await;

        assert_eq!(storage.get("feature:chat"), Some("100".to_string()));
        assert_eq!(storage.hashtable().get("feature:chat"), Some(json!("100")));
        assert_eq!(storage.get("feature:beta"), Some("true".to_string()));

        let (data, _) = ensemble.node("/rollout").unwrap();
        let stored: Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(stored, json!({"feature:chat": "100", "feature:beta": "true"}));
    }

    #[tokio::test]
    async fn foreign_values_read_as_json_text() {
        let ensemble = MemoryEnsemble::new();
        ensemble.put("/rollout", br#"{"n":5,"list":[1,2]}"#.to_vec());
        let map =
            DistributedHashtable::new(Arc::new(ensemble.connect()), "/rollout", Options::new())
                .await
                .unwrap();
        let storage = Storage::from(map);

        assert_eq!(storage.get("n"), Some("5".to_string()));
        assert_eq!(storage.get("list"), Some("[1,2]".to_string()));
    }
}
