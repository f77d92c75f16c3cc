// src/reflect.rs
// Offline reflection over a project's memories: patterns, correlations,
// insights. Read-only and deterministic for fixed inputs.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{ContextdError, Result};
use crate::identity::TenantInfo;
use crate::reasoning::{Memory, Outcome, ReasoningBank};

/// Memory load cap per analysis run.
const MEMORY_CAP: usize = 1000;

/// Confidence-trend thresholds for tag buckets.
const TREND_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    pub min_confidence: f64,
    pub min_frequency: usize,
    pub period: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub include_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub max_patterns: usize,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            min_confidence: 0.3,
            min_frequency: 2,
            period: None,
            include_tags: Vec::new(),
            exclude_tags: Vec::new(),
            max_patterns: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternCategory {
    Success,
    Failure,
    Improving,
    Declining,
    Recurring,
}

impl PatternCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternCategory::Success => "success",
            PatternCategory::Failure => "failure",
            PatternCategory::Improving => "improving",
            PatternCategory::Declining => "declining",
            PatternCategory::Recurring => "recurring",
        }
    }
}

/// An aggregated recurrence across memories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionPattern {
    /// Deterministic id derived from the bucket, so repeat runs agree.
    pub id: String,
    pub category: PatternCategory,
    pub name: String,
    pub frequency: usize,
    pub confidence: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub tags: Vec<String>,
    pub memory_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationType {
    Similar,
    CoOccurs,
    Opposite,
    Sequential,
}

impl CorrelationType {
    pub fn all() -> &'static [CorrelationType] {
        &[
            CorrelationType::Similar,
            CorrelationType::CoOccurs,
            CorrelationType::Opposite,
            CorrelationType::Sequential,
        ]
    }
}

/// A scored relationship between two patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correlation {
    pub pattern_a: String,
    pub pattern_b: String,
    pub kind: CorrelationType,
    pub strength: f64,
}

#[derive(Debug, Clone)]
pub struct CorrelateOptions {
    pub types: Vec<CorrelationType>,
    pub min_strength: f64,
    pub max: usize,
}

impl Default for CorrelateOptions {
    fn default() -> Self {
        Self {
            types: CorrelationType::all().to_vec(),
            min_strength: 0.3,
            max: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub title: String,
    pub detail: String,
}

/// The composed reflection report. JSON is the canonical rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub project_id: String,
    pub generated_at: DateTime<Utc>,
    pub summary: String,
    pub patterns: Vec<ReflectionPattern>,
    pub correlations: Vec<Correlation>,
    pub insights: Vec<Insight>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    Json,
    Text,
    Markdown,
}

impl Report {
    pub fn render(&self, format: ReportFormat) -> Result<String> {
        match format {
            ReportFormat::Json => Ok(serde_json::to_string_pretty(self)?),
            ReportFormat::Text => Ok(self.render_text()),
            ReportFormat::Markdown => Ok(self.render_markdown()),
        }
    }

    fn render_text(&self) -> String {
        let mut out = format!("Reflection report for project {}\n\n{}\n", self.project_id, self.summary);
        if !self.patterns.is_empty() {
            out.push_str("\nPatterns:\n");
            for p in &self.patterns {
                out.push_str(&format!(
                    "  [{}] {} (n={}, confidence {:.2})\n",
                    p.category.as_str(),
                    p.name,
                    p.frequency,
                    p.confidence
                ));
            }
        }
        if !self.insights.is_empty() {
            out.push_str("\nInsights:\n");
            for insight in &self.insights {
                out.push_str(&format!("  {}: {}\n", insight.title, insight.detail));
            }
        }
        if !self.recommendations.is_empty() {
            out.push_str("\nRecommendations:\n");
            for rec in &self.recommendations {
                out.push_str(&format!("  - {rec}\n"));
            }
        }
        out
    }

    fn render_markdown(&self) -> String {
        let mut out = format!("# Reflection report — {}\n\n{}\n", self.project_id, self.summary);
        if !self.patterns.is_empty() {
            out.push_str("\n## Patterns\n\n| Category | Name | Frequency | Confidence |\n|---|---|---|---|\n");
            for p in &self.patterns {
                out.push_str(&format!(
                    "| {} | {} | {} | {:.2} |\n",
                    p.category.as_str(),
                    p.name,
                    p.frequency,
                    p.confidence
                ));
            }
        }
        if !self.insights.is_empty() {
            out.push_str("\n## Insights\n\n");
            for insight in &self.insights {
                out.push_str(&format!("- **{}** — {}\n", insight.title, insight.detail));
            }
        }
        if !self.recommendations.is_empty() {
            out.push_str("\n## Recommendations\n\n");
            for rec in &self.recommendations {
                out.push_str(&format!("- {rec}\n"));
            }
        }
        out
    }
}

/// Offline analysis engine over one project's memories.
pub struct ReflectionEngine {
    bank: Arc<ReasoningBank>,
}

impl ReflectionEngine {
    pub fn new(bank: Arc<ReasoningBank>) -> Self {
        Self { bank }
    }

    /// Bucket memories by outcome and by tag, keep the convincing buckets,
    /// and emit one pattern per survivor.
    pub async fn analyze(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        options: &AnalyzeOptions,
    ) -> Result<Vec<ReflectionPattern>> {
        let memories = self.load_filtered(cancel, tenant, options).await?;
        Ok(analyze_memories(cancel, &memories, options)?)
    }

    /// Score relationships between every unordered pair of patterns.
    pub fn correlate(
        &self,
        cancel: &CancellationToken,
        patterns: &[ReflectionPattern],
        options: &CorrelateOptions,
    ) -> Result<Vec<Correlation>> {
        correlate_patterns(cancel, patterns, options)
    }

    /// Full report: analyze, correlate, then fixed insight heuristics.
    pub async fn generate(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        analyze_options: &AnalyzeOptions,
        correlate_options: &CorrelateOptions,
    ) -> Result<Report> {
        let memories = self.load_filtered(cancel, tenant, analyze_options).await?;
        let patterns = analyze_memories(cancel, &memories, analyze_options)?;
        let correlations = correlate_patterns(cancel, &patterns, correlate_options)?;
        let (insights, recommendations) = derive_insights(&memories, &patterns);

        let summary = format!(
            "Analyzed {} memories into {} patterns and {} correlations.",
            memories.len(),
            patterns.len(),
            correlations.len()
        );

        Ok(Report {
            project_id: tenant.project_id.clone(),
            generated_at: Utc::now(),
            summary,
            patterns,
            correlations,
            insights,
            recommendations,
        })
    }

    async fn load_filtered(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        options: &AnalyzeOptions,
    ) -> Result<Vec<Memory>> {
        let mut memories = self.bank.load_all(cancel, tenant, MEMORY_CAP).await?;
        if let Some((start, end)) = options.period {
            memories.retain(|m| m.created_at >= start && m.created_at <= end);
        }
        if !options.include_tags.is_empty() {
            memories.retain(|m| m.tags.iter().any(|t| options.include_tags.contains(t)));
        }
        if !options.exclude_tags.is_empty() {
            memories.retain(|m| !m.tags.iter().any(|t| options.exclude_tags.contains(t)));
        }
        // Stable input order regardless of driver iteration order.
        memories.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(memories)
    }
}

fn analyze_memories(
    cancel: &CancellationToken,
    memories: &[Memory],
    options: &AnalyzeOptions,
) -> Result<Vec<ReflectionPattern>> {
    // Outcome buckets first, then tag buckets in name order.
    let mut buckets: Vec<(String, PatternBucketKind, Vec<&Memory>)> = Vec::new();
    let success: Vec<&Memory> = memories.iter().filter(|m| m.outcome == Outcome::Success).collect();
    let failure: Vec<&Memory> = memories.iter().filter(|m| m.outcome == Outcome::Failure).collect();
    buckets.push(("success".to_string(), PatternBucketKind::Success, success));
    buckets.push(("failure".to_string(), PatternBucketKind::Failure, failure));

    let mut by_tag: BTreeMap<String, Vec<&Memory>> = BTreeMap::new();
    for memory in memories {
        for tag in &memory.tags {
            by_tag.entry(tag.clone()).or_default().push(memory);
        }
    }
    for (tag, members) in by_tag {
        buckets.push((tag, PatternBucketKind::Tag, members));
    }

    let mut patterns = Vec::new();
    for (name, kind, members) in buckets {
        if cancel.is_cancelled() {
            return Err(ContextdError::Cancelled);
        }
        if members.len() < options.min_frequency {
            continue;
        }
        let confidence = members.iter().map(|m| m.confidence).sum::<f64>() / members.len() as f64;
        if confidence < options.min_confidence {
            continue;
        }

        let category = match kind {
            PatternBucketKind::Success => PatternCategory::Success,
            PatternBucketKind::Failure => PatternCategory::Failure,
            PatternBucketKind::Tag => tag_category(&members),
        };

        let first_seen = members.iter().map(|m| m.created_at).min().unwrap_or_default();
        let last_seen = members.iter().map(|m| m.created_at).max().unwrap_or_default();
        let mut tags: Vec<String> = members
            .iter()
            .flat_map(|m| m.tags.iter().cloned())
            .collect();
        tags.sort();
        tags.dedup();
        let mut memory_ids: Vec<String> = members.iter().map(|m| m.id.clone()).collect();
        memory_ids.sort();

        let id = match kind {
            PatternBucketKind::Success | PatternBucketKind::Failure => format!("pattern_{name}"),
            PatternBucketKind::Tag => format!("pattern_tag_{name}"),
        };

        patterns.push(ReflectionPattern {
            id,
            category,
            name,
            frequency: members.len(),
            confidence,
            first_seen,
            last_seen,
            tags,
            memory_ids,
        });
    }

    patterns.sort_by(|a, b| {
        b.frequency
            .cmp(&a.frequency)
            .then_with(|| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.id.cmp(&b.id))
    });
    patterns.truncate(options.max_patterns);
    Ok(patterns)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternBucketKind {
    Success,
    Failure,
    Tag,
}

/// Confidence trend over a tag bucket: mean of the second half minus mean
/// of the first half, in created_at order.
fn tag_category(members: &[&Memory]) -> PatternCategory {
    let mut sorted: Vec<&&Memory> = members.iter().collect();
    sorted.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    let mid = sorted.len() / 2;
    if mid == 0 {
        return PatternCategory::Recurring;
    }
    let first: f64 = sorted[..mid].iter().map(|m| m.confidence).sum::<f64>() / mid as f64;
    let second_len = sorted.len() - mid;
    let second: f64 =
        sorted[mid..].iter().map(|m| m.confidence).sum::<f64>() / second_len as f64;
    let trend = second - first;
    if trend > TREND_THRESHOLD {
        PatternCategory::Improving
    } else if trend < -TREND_THRESHOLD {
        PatternCategory::Declining
    } else {
        PatternCategory::Recurring
    }
}

fn correlate_patterns(
    cancel: &CancellationToken,
    patterns: &[ReflectionPattern],
    options: &CorrelateOptions,
) -> Result<Vec<Correlation>> {
    let mut correlations = Vec::new();
    for i in 0..patterns.len() {
        if cancel.is_cancelled() {
            return Err(ContextdError::Cancelled);
        }
        for j in (i + 1)..patterns.len() {
            let (a, b) = (&patterns[i], &patterns[j]);
            for kind in &options.types {
                let strength = match kind {
                    CorrelationType::Similar => jaccard(&a.tags, &b.tags),
                    CorrelationType::CoOccurs => jaccard(&a.memory_ids, &b.memory_ids),
                    CorrelationType::Opposite => {
                        let opposed = matches!(
                            (a.category, b.category),
                            (PatternCategory::Success, PatternCategory::Failure)
                                | (PatternCategory::Failure, PatternCategory::Success)
                        );
                        if opposed { jaccard(&a.tags, &b.tags) } else { 0.0 }
                    }
                    CorrelationType::Sequential => {
                        if a.last_seen < b.first_seen || b.last_seen < a.first_seen {
                            0.7
                        } else {
                            0.2
                        }
                    }
                };
                if strength >= options.min_strength {
                    correlations.push(Correlation {
                        pattern_a: a.id.clone(),
                        pattern_b: b.id.clone(),
                        kind: *kind,
                        strength,
                    });
                }
            }
        }
    }

    correlations.sort_by(|a, b| {
        b.strength
            .partial_cmp(&a.strength)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.pattern_a.cmp(&b.pattern_a))
            .then_with(|| a.pattern_b.cmp(&b.pattern_b))
            .then_with(|| a.kind.cmp(&b.kind))
    });
    correlations.truncate(options.max);
    Ok(correlations)
}

fn jaccard(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let shared = a.iter().filter(|x| b.contains(x)).count();
    let union = a.len() + b.len() - shared;
    if union == 0 { 0.0 } else { shared as f64 / union as f64 }
}

/// Fixed insight heuristics over the analysis output.
fn derive_insights(
    memories: &[Memory],
    patterns: &[ReflectionPattern],
) -> (Vec<Insight>, Vec<String>) {
    let mut insights = Vec::new();
    let mut recommendations = Vec::new();

    let successes = memories.iter().filter(|m| m.outcome == Outcome::Success).count();
    let failures = memories.iter().filter(|m| m.outcome == Outcome::Failure).count();
    let labelled = successes + failures;
    if labelled > 0 {
        let success_rate = successes as f64 / labelled as f64;
        if success_rate >= 0.7 {
            insights.push(Insight {
                title: "High Success Rate".to_string(),
                detail: format!(
                    "{:.0}% of outcome-labelled memories are successes.",
                    success_rate * 100.0
                ),
            });
            recommendations
                .push("Keep reinforcing the approaches behind recent successes.".to_string());
        } else if success_rate < 0.5 {
            insights.push(Insight {
                title: "Improvement Opportunity".to_string(),
                detail: format!(
                    "Only {:.0}% of outcome-labelled memories are successes.",
                    success_rate * 100.0
                ),
            });
            recommendations.push(
                "Review failure-labelled memories for recurring root causes.".to_string(),
            );
        }
    }

    let top_tag = patterns
        .iter()
        .filter(|p| p.id.starts_with("pattern_tag_"))
        .max_by(|a, b| {
            a.frequency
                .cmp(&b.frequency)
                .then_with(|| b.id.cmp(&a.id))
        });
    if let Some(top) = top_tag {
        insights.push(Insight {
            title: "Primary Focus Area".to_string(),
            detail: format!("Most activity clusters around '{}' ({} memories).", top.name, top.frequency),
        });
    }

    let has_success = patterns.iter().any(|p| p.category == PatternCategory::Success);
    let has_failure = patterns.iter().any(|p| p.category == PatternCategory::Failure);
    if has_success && has_failure {
        insights.push(Insight {
            title: "Balanced Learning".to_string(),
            detail: "Both successes and failures are being retained.".to_string(),
        });
    }

    let improving = patterns.iter().filter(|p| p.category == PatternCategory::Improving).count();
    let declining = patterns.iter().filter(|p| p.category == PatternCategory::Declining).count();
    if improving > declining {
        insights.push(Insight {
            title: "Positive Trend".to_string(),
            detail: format!("{improving} focus areas show rising confidence."),
        });
    } else if declining > improving {
        insights.push(Insight {
            title: "Negative Trend".to_string(),
            detail: format!("{declining} focus areas show falling confidence."),
        });
        recommendations
            .push("Investigate focus areas with declining confidence.".to_string());
    }

    (insights, recommendations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn memory(
        id: &str,
        outcome: Outcome,
        confidence: f64,
        tags: &[&str],
        day: u32,
    ) -> Memory {
        let created = Utc.with_ymd_and_hms(2026, 1, day, 12, 0, 0).unwrap();
        Memory {
            id: id.to_string(),
            project_id: "p".to_string(),
            title: format!("memory {id}"),
            content: "content".to_string(),
            outcome,
            confidence,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            created_at: created,
            last_reinforced_at: created,
            usage_count: 1,
            helpful_count: 0,
            unhelpful_count: 0,
            consecutive_successes: 0,
        }
    }

    /// Fixed twelve-memory corpus: six successes and six failures, all
    /// carrying the same two tags.
    fn corpus() -> Vec<Memory> {
        let mut memories = Vec::new();
        for i in 0..6 {
            memories.push(memory(
                &format!("s{i}"),
                Outcome::Success,
                0.8,
                &["auth", "db"],
                1 + i as u32,
            ));
            memories.push(memory(
                &format!("f{i}"),
                Outcome::Failure,
                0.6,
                &["auth", "db"],
                7 + i as u32,
            ));
        }
        memories
    }

    #[test]
    fn test_analyze_fixed_corpus() {
        let cancel = CancellationToken::new();
        let options = AnalyzeOptions::default();
        let patterns = analyze_memories(&cancel, &corpus(), &options).unwrap();

        // success + failure + one per shared tag.
        assert_eq!(patterns.len(), 4);
        let ids: Vec<&str> = patterns.iter().map(|p| p.id.as_str()).collect();
        assert!(ids.contains(&"pattern_success"));
        assert!(ids.contains(&"pattern_failure"));
        assert!(ids.contains(&"pattern_tag_auth"));
        assert!(ids.contains(&"pattern_tag_db"));

        let success = patterns.iter().find(|p| p.id == "pattern_success").unwrap();
        assert_eq!(success.frequency, 6);
        assert!((success.confidence - 0.8).abs() < 1e-9);
        assert_eq!(success.category, PatternCategory::Success);

        // Tag buckets: first half confidence 0.8ish vs second half 0.6ish
        // (successes precede failures) -> declining.
        let auth = patterns.iter().find(|p| p.id == "pattern_tag_auth").unwrap();
        assert_eq!(auth.frequency, 12);
        assert_eq!(auth.category, PatternCategory::Declining);
    }

    #[test]
    fn test_correlate_opposite_success_failure() {
        let cancel = CancellationToken::new();
        let patterns = analyze_memories(&cancel, &corpus(), &AnalyzeOptions::default()).unwrap();
        let correlations = correlate_patterns(
            &cancel,
            &patterns,
            &CorrelateOptions {
                types: vec![CorrelationType::Opposite],
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(correlations.len(), 1);
        let opposite = &correlations[0];
        assert_eq!(opposite.kind, CorrelationType::Opposite);
        assert!(opposite.strength >= 0.5);
        let pair = [opposite.pattern_a.as_str(), opposite.pattern_b.as_str()];
        assert!(pair.contains(&"pattern_success"));
        assert!(pair.contains(&"pattern_failure"));
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let cancel = CancellationToken::new();
        let options = AnalyzeOptions::default();
        let first = analyze_memories(&cancel, &corpus(), &options).unwrap();
        let second = analyze_memories(&cancel, &corpus(), &options).unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );

        let correlate = CorrelateOptions::default();
        let c1 = correlate_patterns(&cancel, &first, &correlate).unwrap();
        let c2 = correlate_patterns(&cancel, &second, &correlate).unwrap();
        assert_eq!(
            serde_json::to_string(&c1).unwrap(),
            serde_json::to_string(&c2).unwrap()
        );
    }

    #[test]
    fn test_min_frequency_and_confidence_drop_buckets() {
        let cancel = CancellationToken::new();
        let memories = vec![
            memory("a", Outcome::Success, 0.9, &["solo"], 1),
            // Two-strong bucket, but below min confidence.
            memory("b", Outcome::Failure, 0.1, &["weak"], 2),
            memory("c", Outcome::Failure, 0.1, &["weak"], 3),
        ];
        let patterns = analyze_memories(&cancel, &memories, &AnalyzeOptions::default()).unwrap();
        assert!(patterns.iter().all(|p| p.id != "pattern_tag_solo"));
        assert!(patterns.iter().all(|p| p.id != "pattern_tag_weak"));
        assert!(patterns.iter().all(|p| p.id != "pattern_failure"));
    }

    #[test]
    fn test_sequential_correlation() {
        let cancel = CancellationToken::new();
        let early = ReflectionPattern {
            id: "pattern_tag_a".to_string(),
            category: PatternCategory::Recurring,
            name: "a".to_string(),
            frequency: 2,
            confidence: 0.5,
            first_seen: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            last_seen: Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap(),
            tags: vec!["a".to_string()],
            memory_ids: vec!["m1".to_string()],
        };
        let late = ReflectionPattern {
            id: "pattern_tag_b".to_string(),
            first_seen: Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap(),
            last_seen: Utc.with_ymd_and_hms(2026, 2, 2, 0, 0, 0).unwrap(),
            name: "b".to_string(),
            tags: vec!["b".to_string()],
            memory_ids: vec!["m2".to_string()],
            ..early.clone()
        };
        let correlations = correlate_patterns(
            &cancel,
            &[early, late],
            &CorrelateOptions {
                types: vec![CorrelationType::Sequential],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(correlations.len(), 1);
        assert!((correlations[0].strength - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_insights_balanced_and_rate() {
        let (insights, recommendations) = derive_insights(
            &corpus(),
            &analyze_memories(&CancellationToken::new(), &corpus(), &AnalyzeOptions::default())
                .unwrap(),
        );
        let titles: Vec<&str> = insights.iter().map(|i| i.title.as_str()).collect();
        // 50% success rate: neither high-success nor improvement insight.
        assert!(!titles.contains(&"High Success Rate"));
        assert!(!titles.contains(&"Improvement Opportunity"));
        assert!(titles.contains(&"Balanced Learning"));
        assert!(titles.contains(&"Primary Focus Area"));
        // Both tag buckets decline (successes precede failures).
        assert!(titles.contains(&"Negative Trend"));
        assert!(
            recommendations
                .iter()
                .any(|r| r.contains("declining confidence"))
        );
    }

    #[test]
    fn test_cancellation_respected() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = analyze_memories(&cancel, &corpus(), &AnalyzeOptions::default()).unwrap_err();
        assert_eq!(err.code(), "TIMEOUT_ERROR");
    }
}
