// src/checkpoint.rs
// Checkpoint engine: session snapshots with semantic retrieval,
// threshold-triggered auto-save, and session-start resume.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ContextdError, Result};
use crate::hooks::{HookKind, HookManager};
use crate::identity::{SUFFIX_CHECKPOINTS, TenantInfo, collection_name};
use crate::store::{Document, Filter, Payload, VectorStoreFacade};

pub const MAX_NAME_LEN: usize = 50;
pub const MAX_SUMMARY_LEN: usize = 10_000;
pub const MAX_CONTEXT_LEN: usize = 50_000;
pub const MAX_TAGS: usize = 20;
pub const MAX_TAG_LEN: usize = 50;
pub const MAX_LIST_LIMIT: usize = 100;
pub const MAX_TOP_K: usize = 100;
pub const DEFAULT_RESUME_COUNT: usize = 3;

/// A session snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub session_id: String,
    pub tenant_id: String,
    pub team_id: Option<String>,
    pub project_id: String,
    pub name: String,
    pub description: String,
    pub summary: String,
    pub context: String,
    pub token_count: u64,
    pub threshold: f64,
    pub auto_created: bool,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input to `save`.
#[derive(Debug, Clone, Default)]
pub struct SaveRequest {
    pub session_id: String,
    pub name: String,
    pub description: String,
    pub summary: String,
    pub context: String,
    pub token_count: u64,
    pub threshold: f64,
    pub auto_created: bool,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
}

/// Input to `list`.
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub limit: Option<usize>,
    pub offset: usize,
    pub tags: Vec<String>,
}

/// One search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointHit {
    pub checkpoint: Checkpoint,
    pub score: f32,
}

/// Result of `search`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSearchResult {
    pub hits: Vec<CheckpointHit>,
    pub query: String,
    pub top_k: usize,
}

/// Input to the threshold-triggered auto-save entry point.
#[derive(Debug, Clone)]
pub struct ThresholdRequest {
    pub session_id: String,
    pub project_id: String,
    pub percent: u8,
    pub summary: Option<String>,
    pub context: Option<String>,
}

/// Checkpoint service. Depends only on the store facade; the hook manager
/// handle is injected after construction to break the wiring cycle.
pub struct CheckpointService {
    store: Arc<VectorStoreFacade>,
    hooks: OnceLock<Arc<HookManager>>,
}

impl CheckpointService {
    pub fn new(store: Arc<VectorStoreFacade>) -> Self {
        Self {
            store,
            hooks: OnceLock::new(),
        }
    }

    /// Wire the hook manager. Called once by the registry.
    pub fn set_hook_manager(&self, hooks: Arc<HookManager>) {
        let _ = self.hooks.set(hooks);
    }

    fn collection(&self, tenant: &TenantInfo) -> String {
        collection_name(&tenant.tenant_id, &tenant.project_id, SUFFIX_CHECKPOINTS)
    }

    /// Validate and persist a checkpoint. The embedding is derived from
    /// `summary + "\n\n" + description`.
    pub async fn save(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        req: SaveRequest,
    ) -> Result<Checkpoint> {
        validate_save(&req)?;

        let now = Utc::now();
        let checkpoint = Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: req.session_id,
            tenant_id: tenant.tenant_id.clone(),
            team_id: tenant.team_id.clone(),
            project_id: tenant.project_id.clone(),
            name: req.name,
            description: req.description,
            summary: req.summary,
            context: req.context,
            token_count: req.token_count,
            threshold: req.threshold,
            auto_created: req.auto_created,
            tags: req.tags,
            metadata: req.metadata,
            created_at: now,
            updated_at: now,
        };

        let collection = self.collection(tenant);
        self.store.ensure_collection(cancel, &collection).await?;

        let embed_text = format!("{}\n\n{}", checkpoint.summary, checkpoint.description);
        let doc = Document {
            id: checkpoint.id.clone(),
            content: embed_text,
            embedding: None,
            metadata: checkpoint_payload(&checkpoint),
        };
        self.store
            .upsert(cancel, tenant, &collection, vec![doc])
            .await?;

        info!(
            "Saved checkpoint {} ({} tags, auto={})",
            &checkpoint.id[..8],
            checkpoint.tags.len(),
            checkpoint.auto_created
        );
        Ok(checkpoint)
    }

    /// List checkpoints, newest first. Tag filter is AND.
    pub async fn list(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        req: ListRequest,
    ) -> Result<Vec<Checkpoint>> {
        let limit = req.limit.unwrap_or(10).min(MAX_LIST_LIMIT);
        let collection = self.collection(tenant);
        self.store.ensure_collection(cancel, &collection).await?;

        let filter = tags_filter(&req.tags);
        // Scroll everything in scope, then order in-process: local data
        // volumes are small and the driver offset contract is id-based.
        let docs = self
            .store
            .scroll(cancel, tenant, &collection, Some(filter), 10_000)
            .await?;

        let mut checkpoints: Vec<Checkpoint> = docs
            .into_iter()
            .filter_map(|d| checkpoint_from_payload(&d.id, &d.metadata))
            .collect();
        checkpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        Ok(checkpoints
            .into_iter()
            .skip(req.offset)
            .take(limit)
            .collect())
    }

    /// Semantic search over this project's checkpoints. No minimum score.
    pub async fn search(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        query: &str,
        top_k: Option<usize>,
        tags: &[String],
    ) -> Result<CheckpointSearchResult> {
        let top_k = top_k.unwrap_or(5).min(MAX_TOP_K);
        let collection = self.collection(tenant);
        self.store.ensure_collection(cancel, &collection).await?;

        let hits = self
            .store
            .search(cancel, tenant, &collection, query, top_k, Some(tags_filter(tags)))
            .await?;

        Ok(CheckpointSearchResult {
            hits: hits
                .into_iter()
                .filter_map(|h| {
                    checkpoint_from_payload(&h.id, &h.metadata).map(|checkpoint| CheckpointHit {
                        checkpoint,
                        score: h.score,
                    })
                })
                .collect(),
            query: query.to_string(),
            top_k,
        })
    }

    pub async fn get(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        id: &str,
    ) -> Result<Checkpoint> {
        let collection = self.collection(tenant);
        let docs = self
            .store
            .get(cancel, tenant, &collection, &[id.to_string()])
            .await?;
        docs.first()
            .and_then(|d| checkpoint_from_payload(&d.id, &d.metadata))
            .ok_or_else(|| ContextdError::NotFound(format!("checkpoint {id}")))
    }

    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        id: &str,
    ) -> Result<()> {
        let collection = self.collection(tenant);
        let deleted = self
            .store
            .delete_ids(cancel, tenant, &collection, &[id.to_string()])
            .await?;
        if deleted == 0 {
            return Err(ContextdError::NotFound(format!("checkpoint {id}")));
        }
        Ok(())
    }

    /// Threshold-triggered auto-save. Emits a `context_threshold` hook
    /// event on success; hook failures are logged, never propagated.
    pub async fn save_on_threshold(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        req: ThresholdRequest,
    ) -> Result<Checkpoint> {
        if !(1..=100).contains(&req.percent) {
            return Err(ContextdError::validation(
                "percent",
                "must be between 1 and 100",
            ));
        }
        if req.project_id.contains("..") {
            return Err(ContextdError::validation(
                "project_id",
                "must not contain '..'",
            ));
        }
        let summary = req.summary.unwrap_or_default();
        let context = req.context.unwrap_or_default();
        if summary.chars().count() > MAX_SUMMARY_LEN {
            return Err(ContextdError::validation(
                "summary",
                format!("exceeds {MAX_SUMMARY_LEN} chars"),
            ));
        }
        if context.chars().count() > MAX_CONTEXT_LEN {
            return Err(ContextdError::validation(
                "context",
                format!("exceeds {MAX_CONTEXT_LEN} chars"),
            ));
        }

        let name = if summary.is_empty() {
            format!("Auto-checkpoint at {}%", req.percent)
        } else {
            truncate_name(&summary)
        };

        let mut metadata = HashMap::new();
        metadata.insert("trigger".to_string(), "threshold".to_string());

        let checkpoint = self
            .save(
                cancel,
                tenant,
                SaveRequest {
                    session_id: req.session_id.clone(),
                    name,
                    description: format!("Automatic checkpoint at {}% context usage", req.percent),
                    summary,
                    context,
                    token_count: 0,
                    threshold: f64::from(req.percent) / 100.0,
                    auto_created: true,
                    tags: vec!["auto-save".to_string()],
                    metadata,
                },
            )
            .await?;

        if let Some(hooks) = self.hooks.get() {
            let mut payload = Payload::new();
            payload.insert("checkpoint_id".to_string(), checkpoint.id.clone().into());
            payload.insert("session_id".to_string(), req.session_id.into());
            payload.insert("project_id".to_string(), req.project_id.into());
            payload.insert("percent".to_string(), req.percent.into());
            if let Err(e) = hooks
                .emit(cancel, tenant, HookKind::ContextThreshold, payload)
                .await
            {
                warn!("context_threshold hook failed (checkpoint kept): {e}");
            }
        }

        Ok(checkpoint)
    }

    /// Format the top-K most recent checkpoints as a short scannable block
    /// for session start.
    pub async fn resume(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        count: Option<usize>,
    ) -> Result<String> {
        let count = count.unwrap_or(DEFAULT_RESUME_COUNT);
        let checkpoints = self
            .list(
                cancel,
                tenant,
                ListRequest {
                    limit: Some(count),
                    ..Default::default()
                },
            )
            .await?;

        if checkpoints.is_empty() {
            debug!("No checkpoints to resume for project {}", tenant.project_id);
            return Ok(String::new());
        }

        let mut block = String::from("Recent checkpoints:\n");
        for (rank, checkpoint) in checkpoints.iter().enumerate() {
            // Recency-derived score: the newest checkpoint scores 1.0 and
            // each older one decays with its rank.
            let score = 1.0 / (rank as f32 + 1.0);
            let summary_line: String = checkpoint.summary.chars().take(80).collect();
            block.push_str(&format!(
                "- [{}] {} — {} (score {:.2})\n",
                &checkpoint.id[..8.min(checkpoint.id.len())],
                checkpoint.name,
                summary_line,
                score
            ));
        }
        Ok(block)
    }
}

fn validate_save(req: &SaveRequest) -> Result<()> {
    if req.name.chars().count() > MAX_NAME_LEN {
        return Err(ContextdError::validation(
            "name",
            format!("exceeds {MAX_NAME_LEN} chars"),
        ));
    }
    if req.summary.chars().count() > MAX_SUMMARY_LEN {
        return Err(ContextdError::validation(
            "summary",
            format!("exceeds {MAX_SUMMARY_LEN} chars"),
        ));
    }
    if req.context.chars().count() > MAX_CONTEXT_LEN {
        return Err(ContextdError::validation(
            "context",
            format!("exceeds {MAX_CONTEXT_LEN} chars"),
        ));
    }
    if req.tags.len() > MAX_TAGS {
        return Err(ContextdError::validation(
            "tags",
            format!("at most {MAX_TAGS} tags"),
        ));
    }
    for tag in &req.tags {
        if tag.chars().count() > MAX_TAG_LEN {
            return Err(ContextdError::validation(
                "tags",
                format!("tag '{tag}' exceeds {MAX_TAG_LEN} chars"),
            ));
        }
    }
    if !(0.0..=1.0).contains(&req.threshold) {
        return Err(ContextdError::validation(
            "threshold",
            "must be between 0 and 1",
        ));
    }
    if req.auto_created && !(0.01..=1.0).contains(&req.threshold) {
        return Err(ContextdError::validation(
            "threshold",
            "auto-created checkpoints require a threshold between 0.01 and 1.0",
        ));
    }
    Ok(())
}

/// Truncate a string to the checkpoint name limit, marking the cut.
fn truncate_name(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= MAX_NAME_LEN {
        return s.to_string();
    }
    let mut name: String = chars[..MAX_NAME_LEN - 3].iter().collect();
    name.push_str("...");
    name
}

/// Tag filter: AND over substring membership in the comma-joined tag field.
fn tags_filter(tags: &[String]) -> Filter {
    let mut filter = Filter::new();
    for tag in tags {
        filter = filter.contains("tags", tag.as_str());
    }
    filter
}

/// Mirror the checkpoint struct into a store payload. Tags are serialised
/// comma-joined so the contains filter works on them.
fn checkpoint_payload(checkpoint: &Checkpoint) -> Payload {
    let mut payload = Payload::new();
    payload.insert("kind".to_string(), "checkpoint".into());
    payload.insert("session_id".to_string(), checkpoint.session_id.clone().into());
    payload.insert("name".to_string(), checkpoint.name.clone().into());
    payload.insert(
        "description".to_string(),
        checkpoint.description.clone().into(),
    );
    payload.insert("summary".to_string(), checkpoint.summary.clone().into());
    payload.insert("context".to_string(), checkpoint.context.clone().into());
    payload.insert("token_count".to_string(), checkpoint.token_count.into());
    payload.insert("threshold".to_string(), checkpoint.threshold.into());
    payload.insert("auto_created".to_string(), checkpoint.auto_created.into());
    payload.insert("tags".to_string(), checkpoint.tags.join(",").into());
    payload.insert(
        "extra".to_string(),
        Value::Object(
            checkpoint
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        ),
    );
    payload.insert(
        "created_at".to_string(),
        checkpoint.created_at.to_rfc3339().into(),
    );
    payload.insert(
        "updated_at".to_string(),
        checkpoint.updated_at.to_rfc3339().into(),
    );
    payload
}

fn checkpoint_from_payload(id: &str, payload: &Payload) -> Option<Checkpoint> {
    if payload.get("kind").and_then(|v| v.as_str()) != Some("checkpoint") {
        return None;
    }
    let str_field = |key: &str| {
        payload
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    let created_at = payload
        .get("created_at")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))?;
    let updated_at = payload
        .get("updated_at")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(created_at);
    let tags: Vec<String> = payload
        .get("tags")
        .and_then(|v| v.as_str())
        .map(|s| {
            s.split(',')
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    let metadata: HashMap<String, String> = payload
        .get("extra")
        .and_then(|v| v.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    Some(Checkpoint {
        id: id.to_string(),
        session_id: str_field("session_id"),
        tenant_id: str_field("tenant_id"),
        team_id: payload
            .get("team_id")
            .and_then(|v| v.as_str())
            .map(String::from),
        project_id: str_field("project_id"),
        name: str_field("name"),
        description: str_field("description"),
        summary: str_field("summary"),
        context: str_field("context"),
        token_count: payload
            .get("token_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        threshold: payload
            .get("threshold")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0),
        auto_created: payload
            .get("auto_created")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        tags,
        metadata,
        created_at,
        updated_at,
    })
}
