// tests/reflection_determinism.rs
// Reflection over a fixed memory corpus: exact pattern set, opposite
// correlation, and byte-identical repeat runs (timestamps excluded).

use tokio_util::sync::CancellationToken;

use contextd::config::Config;
use contextd::reasoning::{MemoryDraft, Outcome};
use contextd::reflect::{AnalyzeOptions, CorrelateOptions, CorrelationType, PatternCategory};
use contextd::registry::ServiceRegistry;

async fn seeded_registry() -> ServiceRegistry {
    let registry = ServiceRegistry::in_memory(Config::default());
    let cancel = CancellationToken::new();
    let tenant = registry.tenant_for_path("/p").unwrap();

    // Six successes and six failures, two shared tags each.
    for i in 0..6 {
        registry
            .bank
            .record(
                &cancel,
                &tenant,
                MemoryDraft {
                    title: format!("success {i}"),
                    content: "it worked".to_string(),
                    tags: vec!["auth".to_string(), "db".to_string()],
                    outcome: Outcome::Success,
                    confidence: Some(0.8),
                },
            )
            .await
            .unwrap();
        registry
            .bank
            .record(
                &cancel,
                &tenant,
                MemoryDraft {
                    title: format!("failure {i}"),
                    content: "it did not work".to_string(),
                    tags: vec!["auth".to_string(), "db".to_string()],
                    outcome: Outcome::Failure,
                    confidence: Some(0.6),
                },
            )
            .await
            .unwrap();
    }
    registry
}

#[tokio::test]
async fn fixed_corpus_produces_expected_patterns() {
    let registry = seeded_registry().await;
    let cancel = CancellationToken::new();
    let tenant = registry.tenant_for_path("/p").unwrap();

    let patterns = registry
        .reflection
        .analyze(&cancel, &tenant, &AnalyzeOptions::default())
        .await
        .unwrap();

    // Exactly: success, failure, and one pattern per shared tag.
    assert_eq!(patterns.len(), 4);
    let ids: Vec<&str> = patterns.iter().map(|p| p.id.as_str()).collect();
    assert!(ids.contains(&"pattern_success"));
    assert!(ids.contains(&"pattern_failure"));
    assert!(ids.contains(&"pattern_tag_auth"));
    assert!(ids.contains(&"pattern_tag_db"));

    let success = patterns.iter().find(|p| p.id == "pattern_success").unwrap();
    assert_eq!(success.category, PatternCategory::Success);
    assert_eq!(success.frequency, 6);
    assert!((success.confidence - 0.8).abs() < 1e-9);
}

#[tokio::test]
async fn opposite_correlation_between_success_and_failure() {
    let registry = seeded_registry().await;
    let cancel = CancellationToken::new();
    let tenant = registry.tenant_for_path("/p").unwrap();

    let patterns = registry
        .reflection
        .analyze(&cancel, &tenant, &AnalyzeOptions::default())
        .await
        .unwrap();
    let correlations = registry
        .reflection
        .correlate(
            &cancel,
            &patterns,
            &CorrelateOptions {
                types: vec![CorrelationType::Opposite],
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(correlations.len(), 1);
    assert!(correlations[0].strength >= 0.5);
    let pair = [
        correlations[0].pattern_a.as_str(),
        correlations[0].pattern_b.as_str(),
    ];
    assert!(pair.contains(&"pattern_success"));
    assert!(pair.contains(&"pattern_failure"));
}

#[tokio::test]
async fn analyze_correlate_generate_is_idempotent() {
    let registry = seeded_registry().await;
    let cancel = CancellationToken::new();
    let tenant = registry.tenant_for_path("/p").unwrap();

    let analyze = AnalyzeOptions::default();
    let correlate = CorrelateOptions::default();

    let mut first = registry
        .reflection
        .generate(&cancel, &tenant, &analyze, &correlate)
        .await
        .unwrap();
    let mut second = registry
        .reflection
        .generate(&cancel, &tenant, &analyze, &correlate)
        .await
        .unwrap();

    // Timestamps are excluded from the determinism contract.
    let epoch = chrono::DateTime::<chrono::Utc>::MIN_UTC;
    first.generated_at = epoch;
    second.generated_at = epoch;

    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[tokio::test]
async fn report_renders_all_formats() {
    let registry = seeded_registry().await;
    let cancel = CancellationToken::new();
    let tenant = registry.tenant_for_path("/p").unwrap();

    let report = registry
        .reflection
        .generate(
            &cancel,
            &tenant,
            &AnalyzeOptions::default(),
            &CorrelateOptions::default(),
        )
        .await
        .unwrap();

    let json = report.render(contextd::reflect::ReportFormat::Json).unwrap();
    assert!(serde_json::from_str::<serde_json::Value>(&json).is_ok());

    let text = report.render(contextd::reflect::ReportFormat::Text).unwrap();
    assert!(text.contains("Patterns:"));

    let markdown = report
        .render(contextd::reflect::ReportFormat::Markdown)
        .unwrap();
    assert!(markdown.starts_with("# Reflection report"));
    assert!(markdown.contains("| Category |"));
}
