use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::RwLock;

use super::traits::SessionStorage;
use crate::error::Error;

/// In-process storage. Clones share the same map, which is how several
/// managers in one process stand in for several tabs over one browser store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<RwLock<BTreeMap<String, String>>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl SessionStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), Error> {
        self.entries.write().insert(key.to_owned(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), Error> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Directory-backed storage, one file per key.
///
/// File names are the base64url-encoded keys so any key is a valid name.
/// Writes go to a temporary file first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open (and create if needed) a storage directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Storage(format!("create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    /// Directory holding the key files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(URL_SAFE_NO_PAD.encode(key))
    }
}

impl SessionStorage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("read {key}: {e}"))),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<(), Error> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| Error::Storage(format!("write {key}: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::Storage(format!("rename {key}: {e}")))
    }

    async fn remove(&self, key: &str) -> Result<(), Error> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("remove {key}: {e}"))),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| Error::Storage(format!("list {}: {e}", self.dir.display())))?;

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Storage(format!("list {}: {e}", self.dir.display())))?
        {
            let name = entry.file_name();
            // Skips leftover temporary files and anything not written by us.
            let Some(key) = name
                .to_str()
                .and_then(|n| URL_SAFE_NO_PAD.decode(n).ok())
                .and_then(|bytes| String::from_utf8(bytes).ok())
            else {
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_storage_basic_operations() {
        let storage = MemoryStorage::new();
        assert!(storage.get("a").await.unwrap().is_none());

        storage.set("a", "1".into()).await.unwrap();
        assert_eq!(storage.get("a").await.unwrap().as_deref(), Some("1"));

        storage.remove("a").await.unwrap();
        storage.remove("a").await.unwrap();
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn memory_storage_keys_by_prefix() {
        let storage = MemoryStorage::new();
        for key in ["session:b", "session:a", "sessions", "other:a"] {
            storage.set(key, String::new()).await.unwrap();
        }
        let keys = storage.keys("session:").await.unwrap();
        assert_eq!(keys, vec!["session:a".to_string(), "session:b".to_string()]);
    }

    #[tokio::test]
    async fn memory_storage_clones_share_entries() {
        let tab_a = MemoryStorage::new();
        let tab_b = tab_a.clone();
        tab_a.set("k", "v".into()).await.unwrap();
        assert_eq!(tab_b.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn file_storage_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        storage
            .set("enhanced_session:current", "01J".into())
            .await
            .unwrap();

        let reopened = FileStorage::open(dir.path()).await.unwrap();
        assert_eq!(
            reopened.get("enhanced_session:current").await.unwrap().as_deref(),
            Some("01J")
        );
    }

    #[tokio::test]
    async fn file_storage_keys_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path().join("nested")).await.unwrap();
        storage.set("s:2", "b".into()).await.unwrap();
        storage.set("s:1", "a".into()).await.unwrap();
        storage.set("t:1", "c".into()).await.unwrap();
        tokio::fs::write(dir.path().join("nested").join("not base64!"), "x")
            .await
            .unwrap();

        assert_eq!(
            storage.keys("s:").await.unwrap(),
            vec!["s:1".to_string(), "s:2".to_string()]
        );

        storage.remove("s:1").await.unwrap();
        storage.remove("s:1").await.unwrap();
        assert!(storage.get("s:1").await.unwrap().is_none());
        assert_eq!(storage.keys("s:").await.unwrap(), vec!["s:2".to_string()]);
    }
}
