use node_map::DistributedHashtable;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::Error;

/// Current value of `key` in its string form, read fresh from the server.
pub async fn get(map: &DistributedHashtable, key: &str) -> Result<Option<String>, Error> {
    map.try_read().await?;
    Ok(map.get(key).map(|value| match value {
        Value::String(s) => s,
        other => other.to_string(),
    }))
}

/// Stores `value` as a string under `key` and returns the previous value.
pub async fn set(
    map: &DistributedHashtable,
    key: &str,
    value: &str,
) -> Result<Option<Value>, Error> {
    let previous = map
        .try_update(|m| m.insert(key.to_string(), Value::String(value.to_string())))
        .await?;
    info!(path = map.path(), key, replaced = previous.is_some(), "value stored");
    Ok(previous)
}

pub async fn delete(map: &DistributedHashtable, key: &str) -> Result<Option<Value>, Error> {
    let removed = map.try_update(|m| m.remove(key)).await?;
    info!(path = map.path(), key, found = removed.is_some(), "key deleted");
    Ok(removed)
}

/// Merges a JSON object into the document and returns the merged result.
pub async fn merge(map: &DistributedHashtable, json: &str) -> Result<Map<String, Value>, Error> {
    let other = match serde_json::from_str::<Value>(json)? {
        Value::Object(other) => other,
        other => return Err(Error::NotAnObject(other.to_string())),
    };
    let merged = map
        .try_update(|m| {
            for (key, value) in &other {
                m.insert(key.clone(), value.clone());
            }
            m.clone()
        })
        .await?;
    info!(path = map.path(), keys = other.len(), "object merged");
    Ok(merged)
}

/// The whole document as pretty-printed JSON.
pub async fn dump(map: &DistributedHashtable) -> Result<String, Error> {
    map.try_read().await?;
    debug!(path = map.path(), len = map.len(), "document loaded");
    Ok(serde_json::to_string_pretty(&Value::Object(map.to_map()))?)
}
