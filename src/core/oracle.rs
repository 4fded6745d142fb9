use crate::core::hash::{similarity, Fingerprint, HashError, PerceptualHasher};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Hashing task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Body of `POST /compare`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareRequest {
    pub img1: String,
    pub img2: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CompareResponse {
    pub similarity: f64,
}

/// One entry of a `POST /compareBatch` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairRequest {
    pub img1: String,
    pub img2: String,
    #[serde(rename = "cacheKey", default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairResult {
    pub img1: String,
    pub img2: String,
    pub similarity: f64,
    #[serde(rename = "cacheKey", default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub pairs: Vec<PairRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<PairResult>,
}

/// Where the oracle gets image bytes from.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, HashError>;
}

pub struct HttpImageSource {
    http: reqwest::Client,
}

impl HttpImageSource {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, HashError> {
        let fetch_error = |message: String| HashError::Fetch {
            url: url.to_string(),
            message,
        };

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(fetch_error(format!("status {status}")));
        }
        let bytes = resp.bytes().await.map_err(|e| fetch_error(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Stateless comparison of two images by URL.
pub struct SimilarityOracle {
    source: Arc<dyn ImageSource>,
    hasher: PerceptualHasher,
}

impl SimilarityOracle {
    pub fn new(source: Arc<dyn ImageSource>) -> Self {
        Self {
            source,
            hasher: PerceptualHasher::new(),
        }
    }

    /// Fetch and hash one image. Fetch and decode failures yield `None`.
    pub async fn fingerprint(&self, url: &str) -> Result<Option<Fingerprint>, OracleError> {
        let bytes = match self.source.fetch(url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Error hashing image {}: {}", url, e);
                return Ok(None);
            }
        };

        let hasher = self.hasher.clone();
        let hashed = tokio::task::spawn_blocking(move || hasher.hash_bytes(&bytes)).await?;
        match hashed {
            Ok(fp) => Ok(Some(fp)),
            Err(e) => {
                log::warn!("Error hashing image {}: {}", url, e);
                Ok(None)
            }
        }
    }

    /// Similarity in `[0, 1]`. Only an internal task failure is an error.
    pub async fn compare(&self, img1: &str, img2: &str) -> Result<f64, OracleError> {
        let (a, b) = tokio::join!(self.fingerprint(img1), self.fingerprint(img2));
        Ok(similarity(a?.as_ref(), b?.as_ref()))
    }

    /// Evaluate pairs in order; `results[i]` answers `pairs[i]`.
    pub async fn compare_batch(&self, pairs: Vec<PairRequest>) -> Vec<PairResult> {
        let mut results = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let similarity = match self.compare(&pair.img1, &pair.img2).await {
                Ok(s) => s,
                Err(e) => {
                    log::error!("Error comparing {} and {}: {}", pair.img1, pair.img2, e);
                    0.0
                }
            };
            results.push(PairResult {
                img1: pair.img1,
                img2: pair.img2,
                similarity,
                cache_key: pair.cache_key,
            });
        }
        results
    }
}
