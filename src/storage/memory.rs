use crate::error::Result;
use crate::storage::traits::{check_key, normalize_prefix, Storage};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

/// In-memory storage backed by an ordered map.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        check_key(key)?;
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        check_key(key)?;
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = normalize_prefix(prefix);
        let entries = self.entries.read();
        let mut children = BTreeSet::new();

        for key in entries.range(prefix.clone()..).map(|(k, _)| k) {
            let Some(rest) = key.strip_prefix(prefix.as_str()) else {
                break;
            };
            match rest.find('/') {
                Some(idx) => children.insert(rest[..=idx].to_string()),
                None => children.insert(rest.to_string()),
            };
        }

        Ok(children.into_iter().collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        check_key(key)?;
        self.entries.write().remove(key);
        Ok(())
    }
}
