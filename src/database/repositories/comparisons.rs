use super::{Repository, SharedStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const COMPARISON_PREFIX: &str = "comparison:";

/// Key for the ordered pair `(candidate, reference)`.
pub fn cache_key(candidate: &str, reference: &str) -> String {
    format!("{}{}:{}", COMPARISON_PREFIX, candidate, reference)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedComparison {
    pub similarity: f64,
    pub computed_at: DateTime<Utc>,
}

/// Persisted similarity scores.
pub struct ComparisonRepository {
    store: SharedStore,
}

impl Repository for ComparisonRepository {
    fn store(&self) -> &SharedStore {
        &self.store
    }
}

impl ComparisonRepository {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn get(&self, key: &str) -> Result<Option<CachedComparison>, StoreError> {
        self.read_json(key)
    }

    pub fn put(&self, key: &str, similarity: f64) -> Result<CachedComparison, StoreError> {
        let entry = CachedComparison {
            similarity,
            computed_at: Utc::now(),
        };
        self.write_json(key, &entry)?;
        Ok(entry)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        Ok(self.store.keys_with_prefix(COMPARISON_PREFIX)?.len())
    }

    /// Drop every cached score; returns how many were removed.
    pub fn clear(&self) -> Result<usize, StoreError> {
        let keys = self.store.keys_with_prefix(COMPARISON_PREFIX)?;
        for key in &keys {
            self.store.remove(key)?;
        }
        Ok(keys.len())
    }
}
