// tests/reasoning_outcomes.rs
// Outcome reinforcement and memory invariants end to end.

use tokio_util::sync::CancellationToken;

use contextd::config::Config;
use contextd::reasoning::{MemoryDraft, Outcome};
use contextd::registry::ServiceRegistry;

fn registry() -> ServiceRegistry {
    ServiceRegistry::in_memory(Config::default())
}

fn draft(title: &str) -> MemoryDraft {
    MemoryDraft {
        title: title.to_string(),
        content: "content".to_string(),
        tags: vec![],
        outcome: Outcome::Unknown,
        confidence: None,
    }
}

#[tokio::test]
async fn outcome_reinforcement_trajectory() {
    let registry = registry();
    let cancel = CancellationToken::new();
    let tenant = registry.tenant_for_path("/p").unwrap();

    let memory = registry
        .bank
        .record(&cancel, &tenant, draft("m1"))
        .await
        .unwrap();
    assert_eq!(memory.confidence, 0.5);
    assert_eq!(memory.usage_count, 0);

    // First success: 0.5 + 0.3 * (1.0 - 0.5) = 0.65.
    let confidence = registry
        .bank
        .record_outcome(&cancel, &tenant, &memory.id, true, "s1")
        .await
        .unwrap();
    assert!((confidence - 0.65).abs() < 1e-9);
    let stored = registry.bank.get(&cancel, &tenant, &memory.id).await.unwrap();
    assert_eq!(stored.usage_count, 1);

    // Nine more successes: monotonic, ends at or above 0.9, never above 1.
    let mut last = confidence;
    for _ in 0..9 {
        let confidence = registry
            .bank
            .record_outcome(&cancel, &tenant, &memory.id, true, "s1")
            .await
            .unwrap();
        assert!(confidence >= last);
        assert!(confidence <= 1.0);
        last = confidence;
    }
    assert!(last >= 0.9);
}

#[tokio::test]
async fn confidence_stays_in_unit_interval_under_any_sequence() {
    let registry = registry();
    let cancel = CancellationToken::new();
    let tenant = registry.tenant_for_path("/p").unwrap();
    let memory = registry.bank.record(&cancel, &tenant, draft("m")).await.unwrap();

    // Alternating and repeated outcomes plus feedback.
    let outcomes = [true, false, false, true, true, false, true, false, false, false];
    for succeeded in outcomes {
        let confidence = registry
            .bank
            .record_outcome(&cancel, &tenant, &memory.id, succeeded, "s")
            .await
            .unwrap();
        assert!((0.0..=1.0).contains(&confidence));
    }
    for helpful in [true, false, true] {
        let updated = registry
            .bank
            .feedback(&cancel, &tenant, &memory.id, helpful)
            .await
            .unwrap();
        assert!((0.0..=1.0).contains(&updated.confidence));
    }

    let stored = registry.bank.get(&cancel, &tenant, &memory.id).await.unwrap();
    assert!(stored.helpful_count + stored.unhelpful_count <= stored.usage_count);
    assert_eq!(stored.usage_count, 13);
    assert!(stored.last_reinforced_at >= stored.created_at);
}

#[tokio::test]
async fn failure_label_is_sticky() {
    let registry = registry();
    let cancel = CancellationToken::new();
    let tenant = registry.tenant_for_path("/p").unwrap();
    let memory = registry.bank.record(&cancel, &tenant, draft("m")).await.unwrap();

    registry
        .bank
        .record_outcome(&cancel, &tenant, &memory.id, false, "s")
        .await
        .unwrap();
    registry
        .bank
        .record_outcome(&cancel, &tenant, &memory.id, true, "s")
        .await
        .unwrap();
    // One success is not enough.
    assert_eq!(
        registry.bank.get(&cancel, &tenant, &memory.id).await.unwrap().outcome,
        Outcome::Failure
    );
    registry
        .bank
        .record_outcome(&cancel, &tenant, &memory.id, true, "s")
        .await
        .unwrap();
    assert_eq!(
        registry.bank.get(&cancel, &tenant, &memory.id).await.unwrap().outcome,
        Outcome::Success
    );
}

#[tokio::test]
async fn concurrent_outcomes_are_not_lost() {
    let registry = std::sync::Arc::new(registry());
    let cancel = CancellationToken::new();
    let tenant = registry.tenant_for_path("/p").unwrap();
    let memory = registry.bank.record(&cancel, &tenant, draft("m")).await.unwrap();

    // Four concurrent writers; compare-and-set plus retries must preserve
    // every increment.
    let mut handles = Vec::new();
    for _ in 0..4 {
        let registry = registry.clone();
        let tenant = tenant.clone();
        let id = memory.id.clone();
        handles.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            registry
                .bank
                .record_outcome(&cancel, &tenant, &id, true, "s")
                .await
        }));
    }
    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            succeeded += 1;
        }
    }
    assert!(succeeded >= 1);

    let stored = registry.bank.get(&cancel, &tenant, &memory.id).await.unwrap();
    assert_eq!(stored.usage_count as usize, succeeded);
}

#[tokio::test]
async fn memory_search_returns_score_sorted() {
    let registry = registry();
    let cancel = CancellationToken::new();
    let tenant = registry.tenant_for_path("/p").unwrap();

    registry
        .bank
        .record(&cancel, &tenant, draft("database connection pooling settings"))
        .await
        .unwrap();
    registry
        .bank
        .record(&cancel, &tenant, draft("frontend css grid layout notes"))
        .await
        .unwrap();

    let hits = registry
        .bank
        .search(&cancel, &tenant, "database connection pooling", 10)
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits[0].score >= hits[1].score);
    assert_eq!(hits[0].memory.title, "database connection pooling settings");
}
