// src/embeddings/mod.rs
// Embedding provider module

mod local;
mod openai;

pub use self::local::LocalEmbeddings;
pub use self::openai::OpenAiEmbeddings;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{ContextdError, Result};
use crate::http::FAST_TIMEOUT;

/// Concurrent in-flight embed calls.
const DEFAULT_CONCURRENCY: usize = 8;

/// Calls allowed to wait for a permit before we shed load.
const DEFAULT_QUEUE_LIMIT: usize = 64;

/// Backend-specific embedding implementation
enum EmbeddingBackend {
    OpenAi(OpenAiEmbeddings),
    Local(LocalEmbeddings),
}

/// Embedding client with automatic provider selection.
///
/// Priority: OpenAI-compatible endpoint (requires key) > local hashing
/// embedder (deterministic, offline). Every vector this client returns is
/// unit L2-norm.
pub struct EmbeddingClient {
    backend: EmbeddingBackend,
    permits: Semaphore,
    waiting: AtomicUsize,
    queue_limit: usize,
}

impl EmbeddingClient {
    /// Create from environment: `OPENAI_API_KEY` selects the external
    /// provider, otherwise the local embedder.
    pub fn from_env(dimensions: usize, http_client: reqwest::Client) -> Self {
        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            let model = std::env::var("CONTEXTD_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string());
            info!(model = %model, dimensions, "Using OpenAI-compatible embeddings");
            let mut client = OpenAiEmbeddings::new(api_key, model, dimensions, http_client);
            if let Ok(url) = std::env::var("CONTEXTD_EMBEDDING_URL") {
                client = client.with_api_url(url);
            }
            return Self::new(EmbeddingBackend::OpenAi(client));
        }
        info!(dimensions, "Using local deterministic embeddings");
        Self::new(EmbeddingBackend::Local(LocalEmbeddings::new(dimensions)))
    }

    /// Local-only client, used by tests and `--memory` mode.
    pub fn local(dimensions: usize) -> Self {
        Self::new(EmbeddingBackend::Local(LocalEmbeddings::new(dimensions)))
    }

    fn new(backend: EmbeddingBackend) -> Self {
        Self {
            backend,
            permits: Semaphore::new(DEFAULT_CONCURRENCY),
            waiting: AtomicUsize::new(0),
            queue_limit: DEFAULT_QUEUE_LIMIT,
        }
    }

    pub fn provider_id(&self) -> &'static str {
        match &self.backend {
            EmbeddingBackend::OpenAi(_) => "openai",
            EmbeddingBackend::Local(_) => "local",
        }
    }

    pub fn dimensions(&self) -> usize {
        match &self.backend {
            EmbeddingBackend::OpenAi(c) => c.dimensions(),
            EmbeddingBackend::Local(c) => c.dimensions(),
        }
    }

    /// Whether text sent to this embedder leaves the process. External
    /// providers require scrubbing on the way in.
    pub fn is_external(&self) -> bool {
        matches!(self.backend, EmbeddingBackend::OpenAi(_))
    }

    /// Embed one text, unit-normalised.
    pub async fn embed(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>> {
        let _permit = self.acquire(cancel).await?;
        let vector = match &self.backend {
            EmbeddingBackend::Local(c) => c.embed(text),
            EmbeddingBackend::OpenAi(c) => {
                let fut = tokio::time::timeout(FAST_TIMEOUT, c.embed(text));
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ContextdError::Cancelled),
                    result = fut => result
                        .map_err(|_| ContextdError::timeout("embed"))?
                        .map_err(|e| ContextdError::ExternalUnavailable(format!("embed: {e}")))?,
                }
            }
        };
        Ok(normalize(vector))
    }

    /// Embed many texts, unit-normalised, input order preserved.
    pub async fn embed_batch(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let _permit = self.acquire(cancel).await?;
        let vectors = match &self.backend {
            EmbeddingBackend::Local(c) => c.embed_batch(texts),
            EmbeddingBackend::OpenAi(c) => {
                let fut = tokio::time::timeout(FAST_TIMEOUT, c.embed_batch(texts));
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ContextdError::Cancelled),
                    result = fut => result
                        .map_err(|_| ContextdError::timeout("embed_batch"))?
                        .map_err(|e| ContextdError::ExternalUnavailable(format!("embed_batch: {e}")))?,
                }
            }
        };
        Ok(vectors.into_iter().map(normalize).collect())
    }

    /// Acquire a concurrency permit, shedding load when the wait queue is
    /// full rather than growing without bound.
    async fn acquire(&self, cancel: &CancellationToken) -> Result<tokio::sync::SemaphorePermit<'_>> {
        if let Ok(permit) = self.permits.try_acquire() {
            return Ok(permit);
        }
        let waiting = self.waiting.fetch_add(1, Ordering::SeqCst);
        if waiting >= self.queue_limit {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            warn!("Embedder queue full ({} waiting)", waiting);
            return Err(ContextdError::EmbedderBusy);
        }
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ContextdError::Cancelled),
            permit = self.permits.acquire() => {
                permit.map_err(|_| ContextdError::Internal("embedder semaphore closed".into()))
            }
        };
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Scale a vector to unit L2 norm. Zero vectors map to a fixed unit vector
/// so the norm invariant holds for everything we store.
pub fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        if let Some(first) = vector.first_mut() {
            *first = 1.0;
        }
        return vector;
    }
    for x in &mut vector {
        *x /= norm;
    }
    vector
}
