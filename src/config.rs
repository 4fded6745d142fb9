use crate::core::extractor::ExtractorConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuterConfig {
    pub server_url: String,
    pub max_concurrent_requests: usize,
    /// A post is muted when any of its images scores at least this much
    /// against any reference image.
    pub similarity_threshold: f64,
    pub debounce_ms: u64,
    /// Longest a scan can be postponed by continuous churn. `u64::MAX` turns
    /// the cap off.
    pub debounce_max_wait_ms: u64,
    pub request_timeout_secs: u64,
    pub extractor: ExtractorConfig,
}

impl Default for MuterConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".to_string(),
            max_concurrent_requests: 5,
            similarity_threshold: 0.5,
            debounce_ms: 50,
            debounce_max_wait_ms: 1000,
            request_timeout_secs: 30,
            extractor: ExtractorConfig::default(),
        }
    }
}

impl MuterConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrent_requests",
                message: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Invalid {
                field: "similarity_threshold",
                message: format!("{} is outside [0, 1]", self.similarity_threshold),
            });
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn debounce_max_wait(&self) -> Duration {
        Duration::from_millis(self.debounce_max_wait_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = MuterConfig::default();
        assert_eq!(config.max_concurrent_requests, 5);
        assert_eq!(config.similarity_threshold, 0.5);
        assert_eq!(config.debounce(), Duration::from_millis(50));
        assert_eq!(config.extractor.post_tag, "article");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"similarity_threshold": 0.8, "extractor": {"excluded_substrings": ["emoji", "hashflags"]}}"#,
        )
        .unwrap();

        let config = MuterConfig::load(&path).unwrap();
        assert_eq!(config.similarity_threshold, 0.8);
        assert_eq!(config.server_url, "http://localhost:3000");
        assert_eq!(config.extractor.excluded_substrings, vec!["emoji", "hashflags"]);
        assert_eq!(config.extractor.time_tag, "time");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");

        fs::write(&path, r#"{"max_concurrent_requests": 0}"#).unwrap();
        assert!(matches!(
            MuterConfig::load(&path),
            Err(ConfigError::Invalid { field: "max_concurrent_requests", .. })
        ));

        fs::write(&path, r#"{"similarity_threshold": 1.5}"#).unwrap();
        assert!(matches!(
            MuterConfig::load(&path),
            Err(ConfigError::Invalid { field: "similarity_threshold", .. })
        ));
    }
}
