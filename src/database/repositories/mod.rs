pub mod comparisons;
pub mod settings;

pub use comparisons::{cache_key, CachedComparison, ComparisonRepository};
pub use settings::SettingsRepository;

use super::{SharedStore, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// JSON-encoded values on top of a [`KvStore`](super::KvStore).
pub trait Repository {
    fn store(&self) -> &SharedStore;

    fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.store().get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        self.store().set(key, &bytes)
    }
}
