// src/troubleshoot.rs
// Error diagnosis: team-shared pattern store plus AI hypothesis generation

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ContextdError, Result};
use crate::identity::{TenantInfo, team_collection_name};
use crate::llm::{AiClient, strip_code_fence};
use crate::store::{Document, Filter, Payload, VectorStoreFacade};

/// Score above which a stored pattern answers the diagnosis outright.
const PATTERN_SHORT_CIRCUIT: f32 = 0.8;

/// Patterns retrieved per diagnosis.
const PATTERN_TOP_K: usize = 5;

/// Patterns included in an AI prompt.
const PATTERNS_IN_PROMPT: usize = 3;

/// Concurrent AI diagnosis calls.
const AI_PERMITS: usize = 4;

/// Team used when the caller has none configured.
const DEFAULT_TEAM: &str = "default";

/// A known error recurrence shared across the team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub id: String,
    pub error_type: String,
    pub description: String,
    pub solution: String,
    pub confidence: f64,
    pub frequency: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hypothesis {
    pub description: String,
    pub likelihood: f64,
    #[serde(default)]
    pub evidence: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisSource {
    Pattern,
    Ai,
    Combined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnosis {
    pub root_cause: Option<String>,
    pub hypotheses: Vec<Hypothesis>,
    pub recommendations: Vec<String>,
    pub confidence: f64,
    pub source: DiagnosisSource,
}

#[derive(Debug, Deserialize)]
struct AiDiagnosis {
    root_cause: Option<String>,
    #[serde(default)]
    hypotheses: Vec<Hypothesis>,
    #[serde(default)]
    recommendations: Vec<String>,
}

/// Pattern-matched and AI-hypothesised error diagnosis.
pub struct Troubleshooter {
    store: Arc<VectorStoreFacade>,
    ai: Option<Arc<dyn AiClient>>,
    permits: Semaphore,
}

impl Troubleshooter {
    pub fn new(store: Arc<VectorStoreFacade>, ai: Option<Arc<dyn AiClient>>) -> Self {
        Self {
            store,
            ai,
            permits: Semaphore::new(AI_PERMITS),
        }
    }

    pub fn is_ai_available(&self) -> bool {
        self.ai.is_some()
    }

    /// Team-scoped identity and collection; callers without a team share
    /// the default one.
    fn team_scope(&self, tenant: &TenantInfo) -> (TenantInfo, String) {
        let team = tenant
            .team_id
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TEAM.to_string());
        let collection = team_collection_name(&team);
        let mut scoped = tenant.clone();
        scoped.team_id = Some(team);
        (scoped, collection)
    }

    /// Validate and upsert a pattern. A pattern with identical error type
    /// and description already in the store is warned about, not merged.
    pub async fn save_pattern(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        mut pattern: ErrorPattern,
    ) -> Result<ErrorPattern> {
        if pattern.error_type.trim().is_empty() {
            return Err(ContextdError::validation("error_type", "must not be empty"));
        }
        if pattern.description.trim().is_empty() {
            return Err(ContextdError::validation("description", "must not be empty"));
        }
        if pattern.solution.trim().is_empty() {
            return Err(ContextdError::validation("solution", "must not be empty"));
        }
        if !(0.0..=1.0).contains(&pattern.confidence) {
            return Err(ContextdError::validation(
                "confidence",
                "must be between 0 and 1",
            ));
        }
        if pattern.id.is_empty() {
            pattern.id = format!("pat_{}", uuid::Uuid::new_v4());
        }

        let (scoped, collection) = self.team_scope(tenant);
        self.store.ensure_collection(cancel, &collection).await?;

        let duplicates = self
            .store
            .scroll(
                cancel,
                &scoped,
                &collection,
                Some(Filter::new().eq("error_type", pattern.error_type.as_str())),
                50,
            )
            .await?;
        if duplicates.iter().any(|d| {
            d.id != pattern.id
                && d.metadata.get("description").and_then(|v| v.as_str())
                    == Some(pattern.description.as_str())
        }) {
            warn!(
                "Pattern with identical error_type and description already stored: {}",
                pattern.error_type
            );
        }

        let doc = Document {
            id: pattern.id.clone(),
            content: format!("{}: {}", pattern.error_type, pattern.description),
            embedding: None,
            metadata: pattern_payload(&pattern),
        };
        self.store.upsert(cancel, &scoped, &collection, vec![doc]).await?;
        Ok(pattern)
    }

    /// Bulk load, most frequent first.
    pub async fn get_patterns(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
    ) -> Result<Vec<ErrorPattern>> {
        let (scoped, collection) = self.team_scope(tenant);
        self.store.ensure_collection(cancel, &collection).await?;
        let docs = self
            .store
            .scroll(cancel, &scoped, &collection, None, 10_000)
            .await?;
        let mut patterns: Vec<ErrorPattern> = docs
            .into_iter()
            .filter_map(|d| pattern_from_payload(&d.id, &d.metadata))
            .collect();
        patterns.sort_by(|a, b| b.frequency.cmp(&a.frequency).then_with(|| a.id.cmp(&b.id)));
        Ok(patterns)
    }

    /// Diagnose an error message against the team pattern store, with an
    /// AI fallback when no pattern is a confident match.
    pub async fn diagnose(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        error_msg: &str,
        context: Option<&str>,
    ) -> Result<Diagnosis> {
        if error_msg.trim().is_empty() {
            return Err(ContextdError::validation(
                "error_message",
                "must not be empty",
            ));
        }

        let (scoped, collection) = self.team_scope(tenant);
        self.store.ensure_collection(cancel, &collection).await?;
        let hits = self
            .store
            .search(cancel, &scoped, &collection, error_msg, PATTERN_TOP_K, None)
            .await?;
        let patterns: Vec<(ErrorPattern, f32)> = hits
            .into_iter()
            .filter_map(|h| pattern_from_payload(&h.id, &h.metadata).map(|p| (p, h.score)))
            .collect();

        if let Some((best, score)) = patterns.first() {
            if *score > PATTERN_SHORT_CIRCUIT {
                debug!("Pattern {} short-circuits diagnosis (score {:.2})", best.id, score);
                return Ok(pattern_only(best, *score));
            }
        }

        let Some(ai) = self.ai.as_ref() else {
            return Ok(match patterns.first() {
                Some((best, score)) => pattern_only(best, *score),
                None => empty_diagnosis(),
            });
        };

        let prompt = build_prompt(error_msg, context, &patterns);
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ContextdError::Internal("troubleshoot semaphore closed".into()))?;
        let response = match ai.complete(&prompt, cancel).await {
            Ok(response) => response,
            Err(e) => {
                warn!("AI diagnosis failed, falling back to patterns: {e}");
                return Ok(match patterns.first() {
                    Some((best, score)) => pattern_only(best, *score),
                    None => empty_diagnosis(),
                });
            }
        };

        match serde_json::from_str::<AiDiagnosis>(strip_code_fence(&response)) {
            Ok(parsed) => {
                let mut likelihoods: Vec<f64> =
                    parsed.hypotheses.iter().map(|h| h.likelihood).collect();
                if let Some((_, score)) = patterns.first() {
                    likelihoods.push(f64::from(*score));
                }
                let confidence = if likelihoods.is_empty() {
                    0.0
                } else {
                    likelihoods.iter().sum::<f64>() / likelihoods.len() as f64
                };
                Ok(Diagnosis {
                    root_cause: parsed.root_cause,
                    hypotheses: parsed.hypotheses,
                    recommendations: parsed.recommendations,
                    confidence,
                    source: if patterns.is_empty() {
                        DiagnosisSource::Ai
                    } else {
                        DiagnosisSource::Combined
                    },
                })
            }
            Err(e) => {
                // One fallback on malformed JSON, never a retry loop.
                warn!("AI diagnosis returned malformed JSON: {e}");
                Ok(match patterns.first() {
                    Some((best, score)) => pattern_only(best, *score),
                    None => empty_diagnosis(),
                })
            }
        }
    }
}

fn pattern_only(pattern: &ErrorPattern, score: f32) -> Diagnosis {
    Diagnosis {
        root_cause: Some(pattern.description.clone()),
        hypotheses: vec![Hypothesis {
            description: pattern.description.clone(),
            likelihood: f64::from(score),
            evidence: format!("matched stored pattern '{}'", pattern.error_type),
        }],
        recommendations: vec![pattern.solution.clone()],
        confidence: f64::from(score),
        source: DiagnosisSource::Pattern,
    }
}

fn empty_diagnosis() -> Diagnosis {
    Diagnosis {
        root_cause: None,
        hypotheses: Vec::new(),
        recommendations: Vec::new(),
        confidence: 0.0,
        source: DiagnosisSource::Pattern,
    }
}

fn build_prompt(
    error_msg: &str,
    context: Option<&str>,
    patterns: &[(ErrorPattern, f32)],
) -> String {
    let mut prompt = format!(
        "Diagnose this error from a coding session.\n\nError:\n{error_msg}\n"
    );
    if let Some(context) = context {
        prompt.push_str(&format!("\nContext:\n{context}\n"));
    }
    if !patterns.is_empty() {
        prompt.push_str("\nKnown similar patterns:\n");
        for (pattern, score) in patterns.iter().take(PATTERNS_IN_PROMPT) {
            prompt.push_str(&format!(
                "- [{:.2}] {}: {} (fix: {})\n",
                score, pattern.error_type, pattern.description, pattern.solution
            ));
        }
    }
    prompt.push_str(
        "\nRespond with ONLY strict JSON:\n\
         {\"root_cause\": \"...\", \"hypotheses\": [{\"description\": \"...\", \
         \"likelihood\": 0.0-1.0, \"evidence\": \"...\"}], \"recommendations\": [\"...\"]}",
    );
    prompt
}

fn pattern_payload(pattern: &ErrorPattern) -> Payload {
    let mut payload = Payload::new();
    payload.insert("kind".to_string(), "error_pattern".into());
    payload.insert("error_type".to_string(), pattern.error_type.clone().into());
    payload.insert(
        "description".to_string(),
        pattern.description.clone().into(),
    );
    payload.insert("solution".to_string(), pattern.solution.clone().into());
    payload.insert("confidence".to_string(), pattern.confidence.into());
    payload.insert("frequency".to_string(), pattern.frequency.into());
    payload.insert(
        "created_at".to_string(),
        pattern.created_at.to_rfc3339().into(),
    );
    payload
}

fn pattern_from_payload(id: &str, payload: &Payload) -> Option<ErrorPattern> {
    if payload.get("kind").and_then(|v| v.as_str()) != Some("error_pattern") {
        return None;
    }
    let str_field = |key: &str| {
        payload
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    Some(ErrorPattern {
        id: id.to_string(),
        error_type: str_field("error_type"),
        description: str_field("description"),
        solution: str_field("solution"),
        confidence: payload
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.5),
        frequency: payload.get("frequency").and_then(|v| v.as_u64()).unwrap_or(0),
        created_at: payload
            .get("created_at")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::EmbeddingClient;
    use crate::llm::testing::StaticAiClient;
    use crate::scrub::Scrubber;
    use crate::store::InMemoryBackend;

    fn store() -> Arc<VectorStoreFacade> {
        Arc::new(VectorStoreFacade::new(
            Arc::new(InMemoryBackend::new()),
            Arc::new(EmbeddingClient::local(64)),
            Arc::new(Scrubber::new()),
        ))
    }

    fn tenant() -> TenantInfo {
        TenantInfo::for_path("acme", Some("platform"), "/project")
    }

    fn pattern(error_type: &str, frequency: u64) -> ErrorPattern {
        ErrorPattern {
            id: String::new(),
            error_type: error_type.to_string(),
            description: format!("{error_type} happens when the pool is exhausted"),
            solution: "increase pool size".to_string(),
            confidence: 0.8,
            frequency,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_and_list_by_frequency() {
        let troubleshooter = Troubleshooter::new(store(), None);
        let cancel = CancellationToken::new();
        let t = tenant();
        troubleshooter.save_pattern(&cancel, &t, pattern("timeout", 2)).await.unwrap();
        troubleshooter.save_pattern(&cancel, &t, pattern("deadlock", 9)).await.unwrap();

        let patterns = troubleshooter.get_patterns(&cancel, &t).await.unwrap();
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[0].error_type, "deadlock");
    }

    #[tokio::test]
    async fn test_save_pattern_validation() {
        let troubleshooter = Troubleshooter::new(store(), None);
        let cancel = CancellationToken::new();
        let mut bad = pattern("x", 0);
        bad.solution = String::new();
        assert!(troubleshooter.save_pattern(&cancel, &tenant(), bad).await.is_err());
    }

    #[tokio::test]
    async fn test_diagnose_matches_stored_pattern() {
        let troubleshooter = Troubleshooter::new(store(), None);
        let cancel = CancellationToken::new();
        let t = tenant();
        troubleshooter
            .save_pattern(&cancel, &t, pattern("connection pool exhausted", 3))
            .await
            .unwrap();

        let diagnosis = troubleshooter
            .diagnose(&cancel, &t, "connection pool exhausted in worker", None)
            .await
            .unwrap();
        assert_eq!(diagnosis.source, DiagnosisSource::Pattern);
        assert_eq!(diagnosis.recommendations, vec!["increase pool size".to_string()]);
        assert!(!diagnosis.hypotheses.is_empty());
    }

    #[tokio::test]
    async fn test_diagnose_with_ai_combination() {
        let ai_response = r#"{
            "root_cause": "pool starvation under load",
            "hypotheses": [{"description": "too few connections", "likelihood": 0.6, "evidence": "spikes at peak"}],
            "recommendations": ["raise max_connections"]
        }"#;
        let ai = Arc::new(StaticAiClient::new(vec![ai_response.to_string()]));
        let troubleshooter = Troubleshooter::new(store(), Some(ai));
        let cancel = CancellationToken::new();

        let diagnosis = troubleshooter
            .diagnose(&cancel, &tenant(), "something totally new", None)
            .await
            .unwrap();
        assert_eq!(diagnosis.source, DiagnosisSource::Ai);
        assert_eq!(diagnosis.root_cause.as_deref(), Some("pool starvation under load"));
        assert!((diagnosis.confidence - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_malformed_ai_json_falls_back() {
        let ai = Arc::new(StaticAiClient::new(vec!["{{not json".to_string()]));
        let troubleshooter = Troubleshooter::new(store(), Some(ai));
        let cancel = CancellationToken::new();
        let t = tenant();
        troubleshooter.save_pattern(&cancel, &t, pattern("oom", 1)).await.unwrap();

        let diagnosis = troubleshooter
            .diagnose(&cancel, &t, "completely unrelated words here", None)
            .await
            .unwrap();
        assert_eq!(diagnosis.source, DiagnosisSource::Pattern);
    }

    #[tokio::test]
    async fn test_empty_error_rejected() {
        let troubleshooter = Troubleshooter::new(store(), None);
        let cancel = CancellationToken::new();
        let err = troubleshooter.diagnose(&cancel, &tenant(), "  ", None).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
