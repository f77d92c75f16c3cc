// src/store/mod.rs
// Vector store facade: tenant scoping, isolation policy, keyed write locks,
// metadata markers, and health checks on top of a raw driver.

pub mod backend;
pub mod filter;
pub mod memory;
pub mod qdrant;

pub use backend::{CollectionInfo, Payload, ScoredPoint, StoredPoint, VectorBackend};
pub use filter::{Condition, Filter, FilterOp};
pub use memory::InMemoryBackend;
pub use qdrant::QdrantBackend;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::embeddings::EmbeddingClient;
use crate::error::{ContextdError, Result};
use crate::identity::{
    self, SUFFIX_CHECKPOINTS, SUFFIX_CONVERSATIONS, SUFFIX_MEMORIES, SUFFIX_REMEDIATIONS,
    TenantInfo,
};
use crate::scrub::Scrubber;

/// Budget for any single driver call.
pub const STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Version stamped into every collection's metadata marker.
pub const SCHEMA_VERSION: u64 = 1;

/// Reserved id of the per-collection metadata marker point.
pub const META_POINT_ID: &str = "_meta";

const PROJECT_SUFFIXES: [&str; 4] = [
    SUFFIX_CHECKPOINTS,
    SUFFIX_MEMORIES,
    SUFFIX_REMEDIATIONS,
    SUFFIX_CONVERSATIONS,
];

/// Tenant/project boundary enforcement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationMode {
    /// No enforcement. Test only; every unscoped access is logged.
    None,
    /// Tenant and project filters conjoined into every operation.
    Payload,
    /// Payload filters plus strict collection-name verification.
    CollectionPerProject,
}

impl IsolationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationMode::None => "none",
            IsolationMode::Payload => "payload",
            IsolationMode::CollectionPerProject => "collection-per-project",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(IsolationMode::None),
            "payload" => Some(IsolationMode::Payload),
            "collection-per-project" => Some(IsolationMode::CollectionPerProject),
            _ => None,
        }
    }
}

/// How a collection relates to the caller's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollectionScope {
    Project,
    Team,
    Unscoped,
}

/// A document handed to the facade for storage.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub content: String,
    /// Synthesised from `content` when absent.
    pub embedding: Option<Vec<f32>>,
    pub metadata: Payload,
}

/// A search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub content: String,
    pub metadata: Payload,
    pub score: f32,
}

/// Health status of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    Healthy,
    Empty,
    Corrupt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionHealth {
    pub name: String,
    pub status: CollectionStatus,
}

/// Aggregate metadata-integrity report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: usize,
    pub corrupt: usize,
    pub empty: usize,
    pub total: usize,
    pub collections: Vec<CollectionHealth>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.corrupt == 0
    }
}

/// Uniform CRUD + filtered kNN over named collections.
///
/// Shared by every component; all writes to one collection are serialised
/// through a keyed lock, so reads observe monotonically increasing writes.
pub struct VectorStoreFacade {
    backend: Arc<dyn VectorBackend>,
    embedder: Arc<EmbeddingClient>,
    scrubber: Arc<Scrubber>,
    isolation: RwLock<IsolationMode>,
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    dim: usize,
}

impl VectorStoreFacade {
    pub fn new(
        backend: Arc<dyn VectorBackend>,
        embedder: Arc<EmbeddingClient>,
        scrubber: Arc<Scrubber>,
    ) -> Self {
        let dim = embedder.dimensions();
        Self {
            backend,
            embedder,
            scrubber,
            isolation: RwLock::new(IsolationMode::Payload),
            write_locks: Mutex::new(HashMap::new()),
            dim,
        }
    }

    pub fn set_isolation_mode(&self, mode: IsolationMode) {
        let mut guard = self
            .isolation
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = mode;
    }

    pub fn isolation_mode(&self) -> IsolationMode {
        *self
            .isolation
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn dimensions(&self) -> usize {
        self.dim
    }

    /// Create a collection if missing and stamp its metadata marker.
    pub async fn ensure_collection(&self, cancel: &CancellationToken, name: &str) -> Result<()> {
        check_cancel(cancel)?;
        with_deadline("ensure_collection", self.backend.ensure_collection(name, self.dim)).await?;

        let existing = with_deadline(
            "get",
            self.backend.get(name, &[META_POINT_ID.to_string()]),
        )
        .await?;
        if existing.is_empty() {
            let mut marker_vector = vec![0.0f32; self.dim];
            marker_vector[0] = 1.0;
            let mut payload = Payload::new();
            payload.insert(META_POINT_ID.to_string(), Value::Bool(true));
            payload.insert("schema_version".to_string(), SCHEMA_VERSION.into());
            payload.insert("dim".to_string(), (self.dim as u64).into());
            payload.insert("created_at".to_string(), Utc::now().to_rfc3339().into());
            let marker = StoredPoint::new(META_POINT_ID, marker_vector, payload);
            with_deadline("upsert", self.backend.upsert(name, vec![marker])).await?;
        }
        Ok(())
    }

    /// Upsert documents by id. Missing embeddings are synthesised from
    /// content; everything stored is unit-norm.
    pub async fn upsert(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        collection: &str,
        docs: Vec<Document>,
    ) -> Result<()> {
        check_cancel(cancel)?;
        let scope = self.resolve_scope(tenant, collection)?;

        // Batch-embed everything that arrived without a vector.
        let missing: Vec<String> = docs
            .iter()
            .filter(|d| d.embedding.is_none())
            .map(|d| self.boundary_text(&d.content))
            .collect();
        let mut synthesised = if missing.is_empty() {
            Vec::new()
        } else {
            self.embedder.embed_batch(&missing, cancel).await?
        }
        .into_iter();

        let mut points = Vec::with_capacity(docs.len());
        for doc in docs {
            let vector = match doc.embedding {
                Some(v) => crate::embeddings::normalize(v),
                None => synthesised
                    .next()
                    .ok_or_else(|| ContextdError::Internal("embedding batch underrun".into()))?,
            };
            let mut payload = doc.metadata;
            payload.insert("content".to_string(), doc.content.into());
            self.inject_identity(tenant, scope, &mut payload);
            points.push(StoredPoint::new(doc.id, vector, payload));
        }

        let ids: Vec<String> = points.iter().map(|p| p.id.clone()).collect();
        let _guard = self.write_lock(collection).await;
        check_cancel(cancel)?;
        match timeout(STORE_TIMEOUT, self.backend.upsert(collection, points)).await {
            Ok(result) => result,
            Err(_) => {
                // Roll back whatever half of the batch landed.
                if let Err(e) = self.backend.delete_by_ids(collection, &ids).await {
                    warn!("Rollback after upsert timeout failed: {e}");
                }
                Err(ContextdError::timeout("upsert"))
            }
        }
    }

    /// Semantic search: embed the query, conjoin the caller's identity into
    /// the filter, return hits sorted score-descending (created_at breaks
    /// ties, newest first).
    pub async fn search(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        collection: &str,
        query_text: &str,
        k: usize,
        filter: Option<Filter>,
    ) -> Result<Vec<SearchHit>> {
        check_cancel(cancel)?;
        let scope = self.resolve_scope(tenant, collection)?;
        let query = self.boundary_text(query_text);
        let vector = self.embedder.embed(&query, cancel).await?;
        let scoped = self.scoped_filter(tenant, scope, filter.unwrap_or_default());

        // Fetch one extra so the marker point never displaces a real hit.
        let raw = with_deadline(
            "search",
            self.backend.search(collection, &vector, k + 1, &scoped),
        )
        .await?;

        let mut hits: Vec<SearchHit> = raw
            .into_iter()
            .filter(|p| !p.payload.contains_key(META_POINT_ID))
            .map(|p| {
                let mut metadata = p.payload;
                let content = metadata
                    .remove("content")
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default();
                SearchHit {
                    id: p.id,
                    content,
                    metadata,
                    // Cosine scores from the driver can dip below zero;
                    // the contract is [0, 1].
                    score: p.score.clamp(0.0, 1.0),
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| created_at_of(&b.metadata).cmp(&created_at_of(&a.metadata)))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Fetch documents by id. Points outside the caller's scope are
    /// silently dropped rather than leaked.
    pub async fn get(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        collection: &str,
        ids: &[String],
    ) -> Result<Vec<Document>> {
        check_cancel(cancel)?;
        let scope = self.resolve_scope(tenant, collection)?;
        let points = with_deadline("get", self.backend.get(collection, ids)).await?;
        let guard = self.scoped_filter(tenant, scope, Filter::new());
        Ok(points
            .into_iter()
            .filter(|p| !p.payload.contains_key(META_POINT_ID))
            .filter(|p| guard.matches(&p.payload))
            .map(|p| {
                let mut metadata = p.payload;
                let content = metadata
                    .remove("content")
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default();
                Document {
                    id: p.id,
                    content,
                    embedding: Some(p.vector),
                    metadata,
                }
            })
            .collect())
    }

    /// All documents in the caller's scope matching `filter`, up to `limit`.
    pub async fn scroll(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        collection: &str,
        filter: Option<Filter>,
        limit: usize,
    ) -> Result<Vec<Document>> {
        check_cancel(cancel)?;
        let scope = self.resolve_scope(tenant, collection)?;
        let scoped = self.scoped_filter(tenant, scope, filter.unwrap_or_default());
        // The marker point also matches empty filters; fetch one extra.
        let points = with_deadline("scroll", self.backend.scroll(collection, &scoped, limit + 1))
            .await?;
        let mut docs: Vec<Document> = points
            .into_iter()
            .filter(|p| !p.payload.contains_key(META_POINT_ID))
            .map(|p| {
                let mut metadata = p.payload;
                let content = metadata
                    .remove("content")
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default();
                Document {
                    id: p.id,
                    content,
                    embedding: Some(p.vector),
                    metadata,
                }
            })
            .collect();
        docs.truncate(limit);
        Ok(docs)
    }

    /// Delete documents matching `filter` within the caller's scope.
    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        collection: &str,
        filter: Filter,
    ) -> Result<u64> {
        check_cancel(cancel)?;
        let scope = self.resolve_scope(tenant, collection)?;
        let scoped = self.scoped_filter(tenant, scope, filter);
        let _guard = self.write_lock(collection).await;
        with_deadline("delete", self.backend.delete_by_filter(collection, &scoped)).await
    }

    /// Delete specific ids, restricted to points the caller owns.
    pub async fn delete_ids(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        collection: &str,
        ids: &[String],
    ) -> Result<u64> {
        let owned: Vec<String> = self
            .get(cancel, tenant, collection, ids)
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();
        if owned.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_lock(collection).await;
        with_deadline("delete", self.backend.delete_by_ids(collection, &owned)).await?;
        Ok(owned.len() as u64)
    }

    /// Conditionally replace a point: the write goes through only if the
    /// stored `guard_key` field still equals `expected`. Returns false on
    /// a lost race so the caller can re-read and retry.
    ///
    /// The caller supplies the embedding (updates must not re-embed), and
    /// the get/check/write sequence runs under the collection write lock.
    pub async fn compare_and_swap(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        collection: &str,
        guard_key: &str,
        expected: u64,
        doc: Document,
    ) -> Result<bool> {
        check_cancel(cancel)?;
        let scope = self.resolve_scope(tenant, collection)?;
        let vector = doc
            .embedding
            .map(crate::embeddings::normalize)
            .ok_or_else(|| ContextdError::Internal("compare_and_swap requires an embedding".into()))?;

        let _guard = self.write_lock(collection).await;
        check_cancel(cancel)?;

        let current = with_deadline("get", self.backend.get(collection, &[doc.id.clone()])).await?;
        let Some(point) = current.first() else {
            return Err(ContextdError::NotFound(format!("point {}", doc.id)));
        };
        let actual = point.payload.get(guard_key).and_then(|v| v.as_u64());
        if actual != Some(expected) {
            return Ok(false);
        }

        let mut payload = doc.metadata;
        payload.insert("content".to_string(), doc.content.into());
        self.inject_identity(tenant, scope, &mut payload);
        let point = StoredPoint::new(doc.id, vector, payload);
        with_deadline("upsert", self.backend.upsert(collection, vec![point])).await?;
        Ok(true)
    }

    pub async fn list_collections(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        check_cancel(cancel)?;
        with_deadline("list_collections", self.backend.list_collections()).await
    }

    pub async fn collection_info(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<CollectionInfo> {
        check_cancel(cancel)?;
        with_deadline("collection_info", self.backend.collection_info(name)).await
    }

    /// Metadata-integrity check across all collections.
    ///
    /// Missing marker → `empty`; wrong dimension or corrupt marker →
    /// `corrupt`. The aggregate is healthy iff nothing is corrupt.
    pub async fn health_check(&self, cancel: &CancellationToken) -> Result<HealthReport> {
        let names = self.list_collections(cancel).await?;
        let mut collections = Vec::with_capacity(names.len());
        let (mut healthy, mut corrupt, mut empty) = (0usize, 0usize, 0usize);

        for name in &names {
            check_cancel(cancel)?;
            let status = self.check_one(name).await;
            match status {
                CollectionStatus::Healthy => healthy += 1,
                CollectionStatus::Corrupt => corrupt += 1,
                CollectionStatus::Empty => empty += 1,
            }
            collections.push(CollectionHealth {
                name: name.clone(),
                status,
            });
        }

        Ok(HealthReport {
            healthy,
            corrupt,
            empty,
            total: names.len(),
            collections,
        })
    }

    async fn check_one(&self, name: &str) -> CollectionStatus {
        let info = match with_deadline("collection_info", self.backend.collection_info(name)).await
        {
            Ok(info) => info,
            Err(_) => return CollectionStatus::Corrupt,
        };
        let marker = match with_deadline(
            "get",
            self.backend.get(name, &[META_POINT_ID.to_string()]),
        )
        .await
        {
            Ok(points) => points.into_iter().next(),
            Err(_) => return CollectionStatus::Corrupt,
        };

        let Some(marker) = marker else {
            return CollectionStatus::Empty;
        };
        let schema_version = marker.payload.get("schema_version").and_then(|v| v.as_u64());
        let marker_dim = marker.payload.get("dim").and_then(|v| v.as_u64());
        match (schema_version, marker_dim) {
            (Some(version), Some(dim))
                if version == SCHEMA_VERSION && dim as usize == info.vector_size =>
            {
                CollectionStatus::Healthy
            }
            _ => CollectionStatus::Corrupt,
        }
    }

    /// Text crossing the boundary to an external embedder gets scrubbed.
    fn boundary_text(&self, text: &str) -> String {
        if self.embedder.is_external() {
            self.scrubber.scrub(text).scrubbed
        } else {
            text.to_string()
        }
    }

    /// Verify the caller may address this collection, and classify it.
    fn resolve_scope(&self, tenant: &TenantInfo, collection: &str) -> Result<CollectionScope> {
        identity::validate_tenant_id(&tenant.tenant_id)?;

        if let Some(ref team) = tenant.team_id {
            if !team.is_empty() && collection == identity::team_collection_name(team) {
                return Ok(CollectionScope::Team);
            }
        }
        for suffix in PROJECT_SUFFIXES {
            if collection == identity::collection_name(&tenant.tenant_id, &tenant.project_id, suffix)
            {
                return Ok(CollectionScope::Project);
            }
        }

        match self.isolation_mode() {
            IsolationMode::CollectionPerProject => Err(ContextdError::PermissionDenied(format!(
                "collection {collection} does not match caller project"
            ))),
            IsolationMode::None => {
                debug!("Isolation disabled: unscoped access to {collection}");
                Ok(CollectionScope::Unscoped)
            }
            IsolationMode::Payload => Ok(CollectionScope::Unscoped),
        }
    }

    fn scoped_filter(&self, tenant: &TenantInfo, scope: CollectionScope, base: Filter) -> Filter {
        if self.isolation_mode() == IsolationMode::None {
            debug!("Isolation disabled: filter not scoped to tenant {}", tenant.tenant_id);
            return base;
        }
        let mut filter = base.eq("tenant_id", tenant.tenant_id.as_str());
        match scope {
            CollectionScope::Project => {
                filter = filter.eq("project_id", tenant.project_id.as_str());
            }
            CollectionScope::Team => {
                if let Some(ref team) = tenant.team_id {
                    filter = filter.eq("team_id", team.as_str());
                }
            }
            CollectionScope::Unscoped => {}
        }
        filter
    }

    fn inject_identity(&self, tenant: &TenantInfo, scope: CollectionScope, payload: &mut Payload) {
        payload.insert("tenant_id".to_string(), tenant.tenant_id.clone().into());
        match scope {
            CollectionScope::Project => {
                payload.insert("project_id".to_string(), tenant.project_id.clone().into());
            }
            CollectionScope::Team => {
                if let Some(ref team) = tenant.team_id {
                    payload.insert("team_id".to_string(), team.clone().into());
                }
            }
            CollectionScope::Unscoped => {
                payload.insert("project_id".to_string(), tenant.project_id.clone().into());
            }
        }
    }

    /// Per-collection write lock; writes within one collection are totally
    /// ordered by arrival.
    async fn write_lock(&self, collection: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.write_locks.lock().await;
            locks
                .entry(collection.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ContextdError::Cancelled);
    }
    Ok(())
}

async fn with_deadline<T>(
    operation: &'static str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    timeout(STORE_TIMEOUT, fut)
        .await
        .map_err(|_| ContextdError::timeout(operation))?
}

fn created_at_of(payload: &Payload) -> DateTime<Utc> {
    payload
        .get("created_at")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC)
}
