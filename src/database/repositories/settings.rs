use super::{Repository, SharedStore, StoreError};

pub const MUTED_IMAGES_KEY: &str = "mutedImages";
pub const ENABLED_KEY: &str = "isEnabled";

/// The reference image set and the enabled flag.
pub struct SettingsRepository {
    store: SharedStore,
}

impl Repository for SettingsRepository {
    fn store(&self) -> &SharedStore {
        &self.store
    }
}

impl SettingsRepository {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn load_reference_set(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.read_json(MUTED_IMAGES_KEY)?.unwrap_or_default())
    }

    /// Replaces the whole set.
    pub fn save_reference_set(&self, urls: &[String]) -> Result<(), StoreError> {
        self.write_json(MUTED_IMAGES_KEY, &urls)
    }

    /// Absent means enabled.
    pub fn load_enabled(&self) -> Result<bool, StoreError> {
        Ok(self.read_json(ENABLED_KEY)?.unwrap_or(true))
    }

    pub fn save_enabled(&self, enabled: bool) -> Result<(), StoreError> {
        self.write_json(ENABLED_KEY, &enabled)
    }
}
