use crate::error::{PkiError, Result};
use crate::storage::traits::{check_key, normalize_prefix, Storage};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const TEMP_MARKER: &str = ".tmp-";

/// File-backed storage. Each key is one file under `base_path`.
///
/// Writes land in a temporary sibling file that is renamed over the target,
/// so a concurrent reader sees either the previous blob or the new one.
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    fn key_to_path(&self, key: &str) -> Result<PathBuf> {
        check_key(key)?;

        let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.');
        if !key.chars().all(allowed) || key.contains(TEMP_MARKER) {
            return Err(PkiError::Storage(format!("invalid storage key: {}", key)));
        }

        Ok(self.base_path.join(key))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.key_to_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) if path.is_dir() => {
                tracing::debug!("Storage key {} is a directory: {}", key, e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        let path = self.key_to_path(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| PkiError::Storage(format!("storage key has no parent: {}", key)))?;
        fs::create_dir_all(parent).await?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PkiError::Storage(format!("invalid storage key: {}", key)))?;
        let temp_path = parent.join(format!("{}{}{}", file_name, TEMP_MARKER, uuid::Uuid::new_v4()));

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&value).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = normalize_prefix(prefix);
        let dir = if prefix.is_empty() {
            self.base_path.clone()
        } else {
            self.key_to_path(prefix.trim_end_matches('/'))?
        };

        let mut results = Vec::new();
        if !dir.is_dir() {
            return Ok(results);
        }

        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.contains(TEMP_MARKER) {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                results.push(format!("{}/", name));
            } else {
                results.push(name);
            }
        }

        results.sort();
        Ok(results)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_to_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_storage_put_get_delete() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf()).unwrap();

        storage.put("crls/abc", Bytes::from_static(b"crl-v1")).await.unwrap();
        storage.put("crls/abc", Bytes::from_static(b"crl-v2")).await.unwrap();
        assert_eq!(
            storage.get("crls/abc").await.unwrap(),
            Some(Bytes::from_static(b"crl-v2"))
        );

        storage.delete("crls/abc").await.unwrap();
        assert_eq!(storage.get("crls/abc").await.unwrap(), None);
        storage.delete("crls/abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_local_storage_list_skips_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf()).unwrap();

        storage.put("revoked/01", Bytes::from_static(b"a")).await.unwrap();
        storage.put("revoked/02", Bytes::from_static(b"b")).await.unwrap();
        storage.put("revoked/nested/03", Bytes::from_static(b"c")).await.unwrap();
        std::fs::write(temp_dir.path().join("revoked/04.tmp-stale"), b"partial").unwrap();

        let listed = storage.list("revoked").await.unwrap();
        assert_eq!(listed, vec!["01".to_string(), "02".to_string(), "nested/".to_string()]);
        assert!(storage.list("nothing/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_storage_rejects_bad_keys() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().to_path_buf()).unwrap();

        assert!(storage.put("../escape", Bytes::new()).await.is_err());
        assert!(storage.put("a b", Bytes::new()).await.is_err());
        assert!(storage.get("").await.is_err());
    }
}
