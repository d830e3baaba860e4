use crate::error::{PkiError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Flat key/value storage consumed by the engine.
///
/// Keys are `/`-separated strings. `list` returns the immediate children of
/// `prefix`: leaf keys as bare names and sub-prefixes with a trailing `/`.
/// There are no transactions; implementations must provide read-your-writes.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
    async fn put(&self, key: &str, value: Bytes) -> Result<()>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

pub async fn get_json<T>(storage: &dyn Storage, key: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
{
    match storage.get(key).await? {
        Some(raw) => {
            let value = serde_json::from_slice(&raw).map_err(|e| {
                PkiError::Storage(format!("corrupt entry at {}: {}", key, e))
            })?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

pub async fn put_json<T>(storage: &dyn Storage, key: &str, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let raw = serde_json::to_vec(value)?;
    storage.put(key, Bytes::from(raw)).await
}

/// Validates a storage key: non-empty, relative, no `..` components.
pub(crate) fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(PkiError::Storage("empty storage key".to_string()));
    }
    if key.starts_with('/') || key.split('/').any(|part| part == ".." || part == ".") {
        return Err(PkiError::Storage(format!("invalid storage key: {}", key)));
    }
    Ok(())
}

/// Normalizes a list prefix so that it is either empty or ends with `/`.
pub(crate) fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    }
}
