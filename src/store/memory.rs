// src/store/memory.rs
// In-memory vector backend: exact cosine scan over a BTreeMap.
//
// Used by the test suite and `--memory` mode. Deterministic iteration
// order makes search results stable for equal scores.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{ContextdError, Result};
use crate::store::backend::{CollectionInfo, ScoredPoint, StoredPoint, VectorBackend};
use crate::store::filter::Filter;

#[derive(Debug, Default)]
struct Collection {
    dim: usize,
    points: BTreeMap<String, StoredPoint>,
}

/// Exact-scan in-memory backend.
#[derive(Default)]
pub struct InMemoryBackend {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorBackend for InMemoryBackend {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()> {
        let mut collections = self.collections.write().await;
        collections.entry(name.to_string()).or_insert_with(|| Collection {
            dim,
            points: BTreeMap::new(),
        });
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        Ok(self.collections.read().await.contains_key(name))
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.collections.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn collection_info(&self, name: &str) -> Result<CollectionInfo> {
        let collections = self.collections.read().await;
        let collection = collections
            .get(name)
            .ok_or_else(|| ContextdError::NotFound(format!("collection {name}")))?;
        Ok(CollectionInfo {
            point_count: collection.points.len() as u64,
            vector_size: collection.dim,
        })
    }

    async fn upsert(&self, collection: &str, points: Vec<StoredPoint>) -> Result<()> {
        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| ContextdError::NotFound(format!("collection {collection}")))?;
        for point in points {
            if point.vector.len() != target.dim {
                return Err(ContextdError::validation(
                    "embedding",
                    format!(
                        "dimension {} does not match collection dimension {}",
                        point.vector.len(),
                        target.dim
                    ),
                ));
            }
            target.points.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: &Filter,
    ) -> Result<Vec<ScoredPoint>> {
        let collections = self.collections.read().await;
        let target = collections
            .get(collection)
            .ok_or_else(|| ContextdError::NotFound(format!("collection {collection}")))?;

        let mut scored: Vec<ScoredPoint> = target
            .points
            .values()
            .filter(|p| filter.matches(&p.payload))
            .map(|p| ScoredPoint {
                id: p.id.clone(),
                score: cosine_similarity(vector, &p.vector).max(0.0),
                payload: p.payload.clone(),
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn get(&self, collection: &str, ids: &[String]) -> Result<Vec<StoredPoint>> {
        let collections = self.collections.read().await;
        let target = collections
            .get(collection)
            .ok_or_else(|| ContextdError::NotFound(format!("collection {collection}")))?;
        Ok(ids
            .iter()
            .filter_map(|id| target.points.get(id).cloned())
            .collect())
    }

    async fn scroll(
        &self,
        collection: &str,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<StoredPoint>> {
        let collections = self.collections.read().await;
        let target = collections
            .get(collection)
            .ok_or_else(|| ContextdError::NotFound(format!("collection {collection}")))?;
        Ok(target
            .points
            .values()
            .filter(|p| filter.matches(&p.payload))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_by_ids(&self, collection: &str, ids: &[String]) -> Result<()> {
        let mut collections = self.collections.write().await;
        if let Some(target) = collections.get_mut(collection) {
            for id in ids {
                target.points.remove(id);
            }
        }
        Ok(())
    }

    async fn delete_by_filter(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let mut collections = self.collections.write().await;
        let Some(target) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let doomed: Vec<String> = target
            .points
            .values()
            .filter(|p| filter.matches(&p.payload))
            .map(|p| p.id.clone())
            .collect();
        for id in &doomed {
            target.points.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}

/// Cosine similarity. With unit-norm inputs this is the dot product, but
/// compute the full form so non-normalised test vectors behave.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 0.0;
    }
    dot / (na * nb)
}
