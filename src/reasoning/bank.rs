// src/reasoning/bank.rs
// ReasoningBank: durable distilled memories with outcome reinforcement

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ContextdError, Result};
use crate::identity::{SUFFIX_MEMORIES, TenantInfo, collection_name};
use crate::scrub::Scrubber;
use crate::store::{Document, Filter, Payload, VectorStoreFacade};

/// Base learning rate for outcome reinforcement.
const BASE_LEARNING_RATE: f64 = 0.3;

/// Learning-rate decay per prior use. Highly-used memories are stable.
const LEARNING_RATE_DECAY: f64 = 0.1;

/// Confidence nudge applied by helpful/unhelpful feedback.
const FEEDBACK_NUDGE: f64 = 0.05;

/// Successes in a row needed to flip a failure-labelled memory.
const FLIP_THRESHOLD: u64 = 2;

/// Compare-and-set retry budget for concurrent outcome updates.
const CAS_ATTEMPTS: usize = 3;

/// Purge defaults.
pub const DEFAULT_PURGE_FLOOR: f64 = 0.15;
pub const DEFAULT_PURGE_MIN_USAGE: u64 = 5;

/// Outcome label on a memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    #[default]
    Unknown,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => Outcome::Success,
            "failure" => Outcome::Failure,
            _ => Outcome::Unknown,
        }
    }
}

/// A distilled, outcome-labelled learning retained across sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub content: String,
    pub outcome: Outcome,
    pub confidence: f64,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_reinforced_at: DateTime<Utc>,
    pub usage_count: u64,
    pub helpful_count: u64,
    pub unhelpful_count: u64,
    /// Successes since the last failure; drives the sticky-failure flip.
    #[serde(default)]
    pub consecutive_successes: u64,
}

/// Candidate memory produced by distillation; not yet persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryDraft {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub outcome: Outcome,
    pub confidence: Option<f64>,
}

impl MemoryDraft {
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(ContextdError::validation("title", "must not be empty"));
        }
        if self.content.trim().is_empty() {
            return Err(ContextdError::validation("content", "must not be empty"));
        }
        if let Some(confidence) = self.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(ContextdError::validation(
                    "confidence",
                    "must be between 0 and 1",
                ));
            }
        }
        Ok(())
    }
}

/// Search hit: a memory with its similarity score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHit {
    pub memory: Memory,
    pub score: f32,
}

/// Durable memory store with semantic recall and outcome feedback.
pub struct ReasoningBank {
    store: Arc<VectorStoreFacade>,
    scrubber: Arc<Scrubber>,
}

impl ReasoningBank {
    pub fn new(store: Arc<VectorStoreFacade>, scrubber: Arc<Scrubber>) -> Self {
        Self { store, scrubber }
    }

    fn collection(&self, tenant: &TenantInfo) -> String {
        collection_name(&tenant.tenant_id, &tenant.project_id, SUFFIX_MEMORIES)
    }

    /// Validate and persist a draft as a new memory.
    pub async fn record(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        draft: MemoryDraft,
    ) -> Result<Memory> {
        draft.validate()?;

        let now = Utc::now();
        let memory = Memory {
            id: format!("mem_{}", uuid::Uuid::new_v4()),
            project_id: tenant.project_id.clone(),
            title: draft.title,
            content: draft.content,
            outcome: draft.outcome,
            confidence: draft.confidence.unwrap_or(0.5),
            tags: draft.tags,
            created_at: now,
            last_reinforced_at: now,
            usage_count: 0,
            helpful_count: 0,
            unhelpful_count: 0,
            consecutive_successes: 0,
        };

        let collection = self.collection(tenant);
        self.store.ensure_collection(cancel, &collection).await?;

        let doc = Document {
            id: memory.id.clone(),
            content: self.embed_text(&memory),
            embedding: None,
            metadata: memory_payload(&memory),
        };
        self.store
            .upsert(cancel, tenant, &collection, vec![doc])
            .await?;

        info!("Recorded memory {} ({})", memory.id, memory.outcome.as_str());
        Ok(memory)
    }

    /// Semantic recall; full memories, score-descending.
    pub async fn search(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryHit>> {
        let collection = self.collection(tenant);
        self.store.ensure_collection(cancel, &collection).await?;
        let hits = self
            .store
            .search(cancel, tenant, &collection, query, limit, None)
            .await?;
        Ok(hits
            .into_iter()
            .filter_map(|h| {
                memory_from_payload(&h.id, &h.metadata).map(|memory| MemoryHit {
                    memory,
                    score: h.score,
                })
            })
            .collect())
    }

    pub async fn get(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        id: &str,
    ) -> Result<Memory> {
        let (memory, _) = self.get_with_embedding(cancel, tenant, id).await?;
        Ok(memory)
    }

    async fn get_with_embedding(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        id: &str,
    ) -> Result<(Memory, Vec<f32>)> {
        let collection = self.collection(tenant);
        let docs = self
            .store
            .get(cancel, tenant, &collection, &[id.to_string()])
            .await?;
        let doc = docs
            .into_iter()
            .next()
            .ok_or_else(|| ContextdError::NotFound(format!("memory {id}")))?;
        let memory = memory_from_payload(&doc.id, &doc.metadata)
            .ok_or_else(|| ContextdError::NotFound(format!("memory {id}")))?;
        Ok((memory, doc.embedding.unwrap_or_default()))
    }

    /// Helpful/unhelpful feedback: bumps the matching counter, counts as a
    /// use, and nudges confidence.
    pub async fn feedback(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        id: &str,
        helpful: bool,
    ) -> Result<Memory> {
        self.update_with_cas(cancel, tenant, id, |memory| {
            if helpful {
                memory.helpful_count += 1;
                memory.confidence = (memory.confidence + FEEDBACK_NUDGE).clamp(0.0, 1.0);
            } else {
                memory.unhelpful_count += 1;
                memory.confidence = (memory.confidence - FEEDBACK_NUDGE).clamp(0.0, 1.0);
            }
            memory.usage_count += 1;
            memory.last_reinforced_at = Utc::now();
        })
        .await
    }

    /// Record a success/failure outcome and return the new confidence.
    ///
    /// `c_new = clamp(c + α(target − c))` with `α = 0.3·exp(−0.1·usage)`;
    /// a failure label is sticky until two consecutive successes.
    pub async fn record_outcome(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        id: &str,
        succeeded: bool,
        session_id: &str,
    ) -> Result<f64> {
        let session = session_id.to_string();
        let memory = self
            .update_with_cas(cancel, tenant, id, move |memory| {
                let alpha = BASE_LEARNING_RATE
                    * (-LEARNING_RATE_DECAY * memory.usage_count as f64).exp();
                let target = if succeeded { 1.0 } else { 0.0 };
                memory.confidence =
                    (memory.confidence + alpha * (target - memory.confidence)).clamp(0.0, 1.0);

                if succeeded {
                    memory.consecutive_successes += 1;
                    memory.outcome = match memory.outcome {
                        Outcome::Failure if memory.consecutive_successes < FLIP_THRESHOLD => {
                            Outcome::Failure
                        }
                        _ => Outcome::Success,
                    };
                } else {
                    memory.consecutive_successes = 0;
                    memory.outcome = Outcome::Failure;
                }

                memory.usage_count += 1;
                memory.last_reinforced_at = Utc::now();
                debug!(
                    "Outcome for {} in session {}: succeeded={} confidence={:.3}",
                    memory.id, session, succeeded, memory.confidence
                );
            })
            .await?;
        Ok(memory.confidence)
    }

    /// Delete memories that stayed unconvincing despite real usage.
    pub async fn purge(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        floor: Option<f64>,
        min_usage: Option<u64>,
    ) -> Result<u64> {
        let floor = floor.unwrap_or(DEFAULT_PURGE_FLOOR);
        let min_usage = min_usage.unwrap_or(DEFAULT_PURGE_MIN_USAGE);
        let collection = self.collection(tenant);
        let filter = Filter::new()
            .lt("confidence", floor)
            .gt("usage_count", min_usage.saturating_sub(1));
        let deleted = self.store.delete(cancel, tenant, &collection, filter).await?;
        if deleted > 0 {
            info!("Purged {} low-confidence memories", deleted);
        }
        Ok(deleted)
    }

    /// All memories for a project, capped. Used by the reflection engine.
    pub async fn load_all(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        cap: usize,
    ) -> Result<Vec<Memory>> {
        let collection = self.collection(tenant);
        self.store.ensure_collection(cancel, &collection).await?;
        let docs = self
            .store
            .scroll(cancel, tenant, &collection, None, cap)
            .await?;
        Ok(docs
            .into_iter()
            .filter_map(|d| memory_from_payload(&d.id, &d.metadata))
            .collect())
    }

    /// Read-modify-write guarded by compare-and-set on usage_count;
    /// conflicting writers retry up to three times.
    async fn update_with_cas(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        id: &str,
        mutate: impl Fn(&mut Memory),
    ) -> Result<Memory> {
        let collection = self.collection(tenant);
        for attempt in 0..CAS_ATTEMPTS {
            let (mut memory, embedding) = self.get_with_embedding(cancel, tenant, id).await?;
            let expected = memory.usage_count;
            mutate(&mut memory);

            let doc = Document {
                id: memory.id.clone(),
                content: self.embed_text(&memory),
                embedding: Some(embedding),
                metadata: memory_payload(&memory),
            };
            let swapped = self
                .store
                .compare_and_swap(cancel, tenant, &collection, "usage_count", expected, doc)
                .await?;
            if swapped {
                return Ok(memory);
            }

            warn!("CAS conflict on memory {} (attempt {})", id, attempt + 1);
            let jitter = rand::rng().random_range(5..25);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }
        Err(ContextdError::Internal(format!(
            "memory {id} update lost {CAS_ATTEMPTS} compare-and-set races"
        )))
    }

    fn embed_text(&self, memory: &Memory) -> String {
        self.scrubber
            .scrub(&format!("{}\n{}", memory.title, memory.content))
            .scrubbed
    }
}

fn memory_payload(memory: &Memory) -> Payload {
    let mut payload = Payload::new();
    payload.insert("kind".to_string(), "memory".into());
    payload.insert("title".to_string(), memory.title.clone().into());
    payload.insert("body".to_string(), memory.content.clone().into());
    payload.insert("outcome".to_string(), memory.outcome.as_str().into());
    payload.insert("confidence".to_string(), memory.confidence.into());
    payload.insert("tags".to_string(), memory.tags.join(",").into());
    payload.insert(
        "created_at".to_string(),
        memory.created_at.to_rfc3339().into(),
    );
    payload.insert(
        "last_reinforced_at".to_string(),
        memory.last_reinforced_at.to_rfc3339().into(),
    );
    payload.insert("usage_count".to_string(), memory.usage_count.into());
    payload.insert("helpful_count".to_string(), memory.helpful_count.into());
    payload.insert("unhelpful_count".to_string(), memory.unhelpful_count.into());
    payload.insert(
        "consecutive_successes".to_string(),
        memory.consecutive_successes.into(),
    );
    payload
}

fn memory_from_payload(id: &str, payload: &Payload) -> Option<Memory> {
    if payload.get("kind").and_then(|v| v.as_str()) != Some("memory") {
        return None;
    }
    let str_field = |key: &str| {
        payload
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    let time_field = |key: &str| {
        payload
            .get(key)
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };
    let u64_field = |key: &str| payload.get(key).and_then(|v| v.as_u64()).unwrap_or(0);

    let created_at = time_field("created_at")?;
    Some(Memory {
        id: id.to_string(),
        project_id: str_field("project_id"),
        title: str_field("title"),
        content: str_field("body"),
        outcome: Outcome::parse(&str_field("outcome")),
        confidence: payload
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.5),
        tags: payload
            .get("tags")
            .and_then(|v| v.as_str())
            .map(|s| {
                s.split(',')
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
        created_at,
        last_reinforced_at: time_field("last_reinforced_at").unwrap_or(created_at),
        usage_count: u64_field("usage_count"),
        helpful_count: u64_field("helpful_count"),
        unhelpful_count: u64_field("unhelpful_count"),
        consecutive_successes: u64_field("consecutive_successes"),
    })
}
