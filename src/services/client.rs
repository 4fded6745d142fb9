use crate::core::oracle::{
    BatchRequest, BatchResponse, CompareRequest, CompareResponse, PairRequest, PairResult,
};
use crate::database::repositories::{cache_key, ComparisonRepository};
use crate::database::{SharedStore, StoreError};
use crate::services::pool::WorkerPool;
use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Oracle responded with status {0}")]
    Status(StatusCode),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Anything that can score a candidate image against a reference image.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn compare(&self, candidate: &str, reference: &str) -> Result<f64, ClientError>;
}

/// Talks to the comparison service over HTTP.
pub struct HttpOracle {
    http: reqwest::Client,
    base_url: String,
}

impl HttpOracle {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub async fn compare_batch(
        &self,
        pairs: Vec<PairRequest>,
    ) -> Result<Vec<PairResult>, ClientError> {
        let resp = self
            .http
            .post(format!("{}/compareBatch", self.base_url))
            .json(&BatchRequest { pairs })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ClientError::Status(resp.status()));
        }
        let body: BatchResponse = resp.json().await?;
        Ok(body.results)
    }
}

#[async_trait]
impl Oracle for HttpOracle {
    async fn compare(&self, candidate: &str, reference: &str) -> Result<f64, ClientError> {
        let resp = self
            .http
            .post(format!("{}/compare", self.base_url))
            .json(&CompareRequest {
                img1: candidate.to_string(),
                img2: reference.to_string(),
            })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ClientError::Status(resp.status()));
        }
        let body: CompareResponse = resp.json().await?;
        Ok(clamp_score(body.similarity))
    }
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComparisonPair {
    pub candidate: String,
    pub reference: String,
}

impl ComparisonPair {
    pub fn new(candidate: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            reference: reference.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonResult {
    pub candidate: String,
    pub reference: String,
    pub similarity: f64,
    pub cache_key: String,
    pub from_cache: bool,
}

/// A cache miss waiting for the oracle.
struct PendingComparison {
    candidate: String,
    reference: String,
    cache_key: String,
}

type Waiters = Arc<Mutex<HashMap<String, Vec<oneshot::Sender<f64>>>>>;

/// Resolves comparison pairs with as few oracle calls as possible: cached
/// scores short-circuit, identical pending pairs share one request, and at
/// most `limit` requests are in flight at once.
pub struct SimilarityClient {
    oracle: Arc<dyn Oracle>,
    cache: Arc<ComparisonRepository>,
    pool: WorkerPool,
    waiters: Waiters,
}

impl SimilarityClient {
    pub fn new(oracle: Arc<dyn Oracle>, store: SharedStore, limit: usize) -> Self {
        Self {
            oracle,
            cache: Arc::new(ComparisonRepository::new(store)),
            pool: WorkerPool::new(limit),
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    fn cached(&self, key: &str) -> Option<f64> {
        match self.cache.get(key) {
            Ok(entry) => entry.map(|c| c.similarity),
            Err(e) => {
                log::warn!("Ignoring unreadable cache entry {}: {}", key, e);
                None
            }
        }
    }

    /// One result per input pair, in input order. Each distinct pair is sent
    /// to the oracle at most once per call, even when it fails.
    pub async fn resolve_batch(&self, pairs: &[ComparisonPair]) -> Vec<ComparisonResult> {
        let mut results: Vec<Option<ComparisonResult>> = vec![None; pairs.len()];
        let mut misses: Vec<(String, Vec<usize>)> = Vec::new();
        let mut miss_index: HashMap<String, usize> = HashMap::new();

        for (index, pair) in pairs.iter().enumerate() {
            let key = cache_key(&pair.candidate, &pair.reference);
            if let Some(&slot) = miss_index.get(&key) {
                misses[slot].1.push(index);
                continue;
            }
            if let Some(similarity) = self.cached(&key) {
                log::debug!(
                    "Using cached similarity for {} vs {}: {}",
                    pair.candidate,
                    pair.reference,
                    similarity
                );
                results[index] = Some(ComparisonResult {
                    candidate: pair.candidate.clone(),
                    reference: pair.reference.clone(),
                    similarity,
                    cache_key: key,
                    from_cache: true,
                });
                continue;
            }
            miss_index.insert(key.clone(), misses.len());
            misses.push((key, vec![index]));
        }

        let pending: Vec<_> = misses
            .into_iter()
            .map(|(key, indexes)| {
                let pair = &pairs[indexes[0]];
                let receiver = self.enqueue(PendingComparison {
                    candidate: pair.candidate.clone(),
                    reference: pair.reference.clone(),
                    cache_key: key.clone(),
                });
                (key, indexes, receiver)
            })
            .collect();

        let resolved = join_all(pending.into_iter().map(|(key, indexes, receiver)| async move {
            // A dropped sender means the job died; treat it like a failure.
            (key, indexes, receiver.await.unwrap_or(0.0))
        }))
        .await;

        for (key, indexes, similarity) in resolved {
            for index in indexes {
                let pair = &pairs[index];
                results[index] = Some(ComparisonResult {
                    candidate: pair.candidate.clone(),
                    reference: pair.reference.clone(),
                    similarity,
                    cache_key: key.clone(),
                    from_cache: false,
                });
            }
        }

        results.into_iter().flatten().collect()
    }

    fn enqueue(&self, request: PendingComparison) -> oneshot::Receiver<f64> {
        let (sender, receiver) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = waiters.get_mut(&request.cache_key) {
                existing.push(sender);
                return receiver;
            }
            // The previous request for this key may have finished since the
            // caller's cache read.
            if let Some(similarity) = self.cached(&request.cache_key) {
                let _ = sender.send(similarity);
                return receiver;
            }
            waiters.insert(request.cache_key.clone(), vec![sender]);
        }

        let oracle = self.oracle.clone();
        let cache = self.cache.clone();
        let waiters = self.waiters.clone();
        self.pool.submit(async move {
            let similarity = match oracle.compare(&request.candidate, &request.reference).await {
                Ok(similarity) => {
                    if let Err(e) = cache.put(&request.cache_key, similarity) {
                        log::warn!("Failed to cache {}: {}", request.cache_key, e);
                    }
                    similarity
                }
                Err(e) => {
                    log::warn!(
                        "Error comparing {} vs {}: {}",
                        request.candidate,
                        request.reference,
                        e
                    );
                    0.0
                }
            };

            let senders = waiters
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&request.cache_key)
                .unwrap_or_default();
            for sender in senders {
                let _ = sender.send(similarity);
            }
        });
        receiver
    }
}
