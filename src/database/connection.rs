use super::{KvStore, StoreError};
use std::path::{Path, PathBuf};

/// Persistent store backed by an embedded sled tree.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Path(format!("Could not create {}: {}", parent.display(), e))
            })?;
        }
        let db = sled::open(path)?;
        log::debug!("Opened store at {}", path.display());
        Ok(Self { db })
    }
}

impl KvStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.db.remove(key)?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.db
            .scan_prefix(prefix)
            .keys()
            .map(|k| -> Result<String, StoreError> {
                Ok(String::from_utf8_lossy(&k?).into_owned())
            })
            .collect()
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

pub fn default_store_path() -> Result<PathBuf, StoreError> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| StoreError::Path("Could not find data directory".to_string()))?;
    Ok(data_dir.join("imgmute").join("store"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_values_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store");

        {
            let store = SledStore::open(&path).unwrap();
            store.set("comparison:a:b", b"0.75").unwrap();
            store.set("isEnabled", b"false").unwrap();
            store.flush().unwrap();
        }

        let store = SledStore::open(&path).unwrap();
        assert_eq!(store.get("comparison:a:b").unwrap(), Some(b"0.75".to_vec()));
        assert_eq!(
            store.keys_with_prefix("comparison:").unwrap(),
            vec!["comparison:a:b"]
        );
    }

    #[test]
    fn test_remove() {
        let temp_dir = TempDir::new().unwrap();
        let store = SledStore::open(temp_dir.path().join("store")).unwrap();

        store.set("k", b"v").unwrap();
        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }
}
