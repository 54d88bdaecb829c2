//! Embedding providers.
//!
//! Two interchangeable implementations of one contract: a local MiniLM-class
//! model served by fastembed (384d, offline after the first model download)
//! and the Voyage AI HTTP API (1024d). The provider also names the collection
//! suffix and the state file, so ingest ledgers for the two vector spaces
//! never mix.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::{Config, EMBED_BATCH_SIZE, MAX_RETRIES, RETRY_CAP_SECS};
use crate::error::{AppError, AppResult};

pub const LOCAL_DIM: usize = 384;
pub const LOCAL_SUFFIX: &str = "local";
pub const LOCAL_STATE_FILENAME: &str = "recall-watcher.json";

pub const VOYAGE_DIM: usize = 1024;
pub const VOYAGE_SUFFIX: &str = "voyage";
pub const VOYAGE_STATE_FILENAME: &str = "recall-watcher-cloud.json";
const VOYAGE_MODEL: &str = "voyage-3-large";
const VOYAGE_URL: &str = "https://api.voyageai.com/v1/embeddings";

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dim(&self) -> usize;
    /// Collection-name suffix for this vector space.
    fn suffix(&self) -> &'static str;
    /// Ingest ledger file name for this provider.
    fn state_filename(&self) -> &'static str;
    fn model_name(&self) -> &'static str;

    async fn embed_query(&self, text: &str) -> AppResult<Vec<f32>>;
    /// Batched document vectors, in input order. Empty input is rejected.
    async fn embed_documents(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>>;
}

/// Pick the provider from configuration. `prefer_local=false` without a cloud
/// key falls back to local with a logged decision; startup never fails for a
/// missing key alone.
pub fn select_provider(config: &Config) -> AppResult<Arc<dyn EmbeddingProvider>> {
    if config.prefer_local {
        return Ok(Arc::new(LocalEmbedder::new(
            config.fastembed_cache_dir.clone(),
        )));
    }
    match &config.voyage_api_key {
        Some(key) => Ok(Arc::new(VoyageEmbedder::new(
            key.clone(),
            config.request_timeout_s,
        )?)),
        None => {
            warn!("cloud embeddings requested but no API key configured; falling back to local provider");
            Ok(Arc::new(LocalEmbedder::new(
                config.fastembed_cache_dir.clone(),
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Local provider (fastembed)
// ---------------------------------------------------------------------------

pub struct LocalEmbedder {
    /// Model behind a std Mutex: fastembed inference is synchronous and runs
    /// under spawn_blocking, which cannot hold an async lock.
    model: Arc<Mutex<Option<TextEmbedding>>>,
    cache_dir: PathBuf,
    initialized: AtomicBool,
}

impl LocalEmbedder {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            model: Arc::new(Mutex::new(None)),
            cache_dir,
            initialized: AtomicBool::new(false),
        }
    }

    /// Embed on the blocking pool, lazily initializing the model. The first
    /// call downloads weights into the cache dir; afterwards no network.
    async fn embed_blocking(&self, texts: Vec<String>) -> AppResult<Vec<Vec<f32>>> {
        let model = self.model.clone();
        let cache_dir = self.cache_dir.clone();
        let first_init = !self.initialized.load(Ordering::Acquire);

        let embeddings = tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|e| AppError::EmbeddingUnavailable(format!("model lock poisoned: {e}")))?;

            if guard.is_none() {
                if first_init {
                    info!(cache_dir = %cache_dir.display(), "initializing local embedding model ({LOCAL_DIM}d)");
                }
                let loaded = TextEmbedding::try_new(
                    InitOptions::new(EmbeddingModel::AllMiniLML6V2)
                        .with_cache_dir(cache_dir)
                        .with_show_download_progress(false),
                )
                .map_err(|e| {
                    AppError::EmbeddingUnavailable(format!("failed to load local model: {e}"))
                })?;
                *guard = Some(loaded);
            }

            let model = guard
                .as_mut()
                .ok_or_else(|| AppError::EmbeddingUnavailable("model not initialized".into()))?;
            model
                .embed(texts, Some(EMBED_BATCH_SIZE))
                .map_err(|e| AppError::TransientProvider(format!("local embedding failed: {e}")))
        })
        .await
        .map_err(|e| AppError::EmbeddingUnavailable(format!("embedding task panicked: {e}")))??;

        self.initialized.store(true, Ordering::Release);
        Ok(embeddings)
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbedder {
    fn dim(&self) -> usize {
        LOCAL_DIM
    }
    fn suffix(&self) -> &'static str {
        LOCAL_SUFFIX
    }
    fn state_filename(&self) -> &'static str {
        LOCAL_STATE_FILENAME
    }
    fn model_name(&self) -> &'static str {
        "all-MiniLM-L6-v2"
    }

    async fn embed_query(&self, text: &str) -> AppResult<Vec<f32>> {
        let mut vectors = self.embed_blocking(vec![text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| AppError::EmbeddingUnavailable("empty embedding response".into()))
    }

    async fn embed_documents(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Err(AppError::Internal(anyhow::anyhow!(
                "embed_documents called with empty input"
            )));
        }
        self.embed_blocking(texts.to_vec()).await
    }
}

// ---------------------------------------------------------------------------
// Voyage AI provider (HTTP)
// ---------------------------------------------------------------------------

pub struct VoyageEmbedder {
    client: reqwest::Client,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct VoyageResponse {
    data: Vec<VoyageEmbedding>,
}

#[derive(Debug, Deserialize)]
struct VoyageEmbedding {
    embedding: Vec<f32>,
}

impl VoyageEmbedder {
    pub fn new(api_key: String, timeout_s: u64) -> AppResult<Self> {
        if api_key.is_empty() {
            return Err(AppError::AuthFailure("Voyage API key is empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_s))
            .build()?;
        Ok(Self { client, api_key })
    }

    /// One embeddings call with retry. 429/5xx/network errors back off
    /// exponentially (1s, 2s, 4s, capped); 401/403 is an auth failure and
    /// other 4xx fail immediately.
    async fn call(&self, texts: &[String], input_type: &str) -> AppResult<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": VOYAGE_MODEL,
            "input": texts,
            "input_type": input_type,
        });

        let mut last_err: Option<AppError> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = RETRY_CAP_SECS.min(1u64 << attempt.min(5));
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }

            let resp = self
                .client
                .post(VOYAGE_URL)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let parsed: VoyageResponse = response.json().await?;
                        return Ok(parsed.data.into_iter().map(|e| e.embedding).collect());
                    }

                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        let text = response.text().await.unwrap_or_default();
                        return Err(AppError::AuthFailure(format!("Voyage {status}: {text}")));
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let text = response.text().await.unwrap_or_default();
                        last_err = Some(AppError::TransientProvider(format!(
                            "Voyage {status}: {text}"
                        )));
                        continue;
                    }

                    let text = response.text().await.unwrap_or_default();
                    return Err(AppError::EmbeddingUnavailable(format!(
                        "Voyage {status}: {text}"
                    )));
                }
                Err(e) => {
                    last_err = Some(AppError::TransientProvider(format!("Voyage request: {e}")));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            AppError::TransientProvider("Voyage embedding failed after retries".into())
        }))
    }
}

#[async_trait]
impl EmbeddingProvider for VoyageEmbedder {
    fn dim(&self) -> usize {
        VOYAGE_DIM
    }
    fn suffix(&self) -> &'static str {
        VOYAGE_SUFFIX
    }
    fn state_filename(&self) -> &'static str {
        VOYAGE_STATE_FILENAME
    }
    fn model_name(&self) -> &'static str {
        VOYAGE_MODEL
    }

    async fn embed_query(&self, text: &str) -> AppResult<Vec<f32>> {
        let mut vectors = self.call(&[text.to_string()], "query").await?;
        vectors
            .pop()
            .ok_or_else(|| AppError::EmbeddingUnavailable("empty embedding response".into()))
    }

    async fn embed_documents(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Err(AppError::Internal(anyhow::anyhow!(
                "embed_documents called with empty input"
            )));
        }
        self.call(texts, "document").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_constants() {
        let local = LocalEmbedder::new(PathBuf::from("/tmp/cache"));
        assert_eq!(local.dim(), 384);
        assert_eq!(local.suffix(), "local");
        assert_eq!(local.state_filename(), "recall-watcher.json");
    }

    #[test]
    fn test_voyage_requires_key() {
        match VoyageEmbedder::new(String::new(), 30) {
            Err(AppError::AuthFailure(_)) => {}
            other => panic!("expected AuthFailure, got {:?}", other.map(|_| ())),
        }
        let ok = VoyageEmbedder::new("key".into(), 30).unwrap();
        assert_eq!(ok.dim(), 1024);
        assert_eq!(ok.suffix(), "voyage");
        assert_eq!(ok.state_filename(), "recall-watcher-cloud.json");
    }

    #[test]
    fn test_select_provider_falls_back_to_local() {
        let mut config = Config::from_env();
        config.prefer_local = false;
        config.voyage_api_key = None;
        let provider = select_provider(&config).unwrap();
        assert_eq!(provider.suffix(), "local");
    }

    #[test]
    fn test_select_provider_prefers_local() {
        let mut config = Config::from_env();
        config.prefer_local = true;
        config.voyage_api_key = Some("key".into());
        let provider = select_provider(&config).unwrap();
        assert_eq!(provider.suffix(), "local");
    }

    #[test]
    fn test_select_provider_cloud_with_key() {
        let mut config = Config::from_env();
        config.prefer_local = false;
        config.voyage_api_key = Some("key".into());
        let provider = select_provider(&config).unwrap();
        assert_eq!(provider.suffix(), "voyage");
        assert_eq!(provider.dim(), 1024);
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let local = LocalEmbedder::new(PathBuf::from("/tmp/cache"));
        assert!(local.embed_documents(&[]).await.is_err());
    }
}
