// src/store/backend.rs
// Narrow driver contract implemented by the Qdrant and in-memory backends

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::store::filter::Filter;

/// Arbitrary per-point metadata.
pub type Payload = serde_json::Map<String, Value>;

/// A point as stored: id, vector, payload.
#[derive(Debug, Clone)]
pub struct StoredPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

impl StoredPoint {
    pub fn new(id: impl Into<String>, vector: Vec<f32>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            vector,
            payload,
        }
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// A search result with similarity score.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: Payload,
}

/// Collection statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionInfo {
    pub point_count: u64,
    pub vector_size: usize,
}

/// The raw vector-store driver contract.
///
/// Drivers know nothing about tenants, isolation, or embedding; the facade
/// layers those on top. All vectors passed in are unit L2-norm.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Create the collection if missing. Idempotent.
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()>;

    async fn collection_exists(&self, name: &str) -> Result<bool>;

    async fn list_collections(&self) -> Result<Vec<String>>;

    async fn collection_info(&self, name: &str) -> Result<CollectionInfo>;

    /// Upsert by point id.
    async fn upsert(&self, collection: &str, points: Vec<StoredPoint>) -> Result<()>;

    /// kNN by cosine similarity; returns `score = 1 - cosine_distance`,
    /// descending, at most `limit` points matching `filter`.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: &Filter,
    ) -> Result<Vec<ScoredPoint>>;

    async fn get(&self, collection: &str, ids: &[String]) -> Result<Vec<StoredPoint>>;

    /// All points matching `filter`, up to `limit`, in driver order.
    async fn scroll(&self, collection: &str, filter: &Filter, limit: usize)
        -> Result<Vec<StoredPoint>>;

    async fn delete_by_ids(&self, collection: &str, ids: &[String]) -> Result<()>;

    /// Delete matching points, returning how many were removed when the
    /// driver can tell (0 otherwise).
    async fn delete_by_filter(&self, collection: &str, filter: &Filter) -> Result<u64>;
}
