// tests/checkpoint_flow.rs
// End-to-end checkpoint scenarios against the in-memory backend.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use contextd::checkpoint::{ListRequest, SaveRequest, ThresholdRequest};
use contextd::config::Config;
use contextd::registry::ServiceRegistry;
use contextd::store::IsolationMode;

fn registry() -> ServiceRegistry {
    ServiceRegistry::in_memory(Config::default())
}

fn save_request(summary: &str, description: &str, tags: &[&str]) -> SaveRequest {
    SaveRequest {
        session_id: "session-1".to_string(),
        name: summary.chars().take(50).collect(),
        description: description.to_string(),
        summary: summary.to_string(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        metadata: HashMap::new(),
        ..Default::default()
    }
}

#[tokio::test]
async fn checkpoint_round_trip() {
    let registry = registry();
    let cancel = CancellationToken::new();
    let tenant = registry.tenant_for_path("/p").unwrap();

    let saved = registry
        .checkpoints
        .save(
            &cancel,
            &tenant,
            save_request(
                "implemented jwt auth",
                "added refresh tokens",
                &["auth", "security"],
            ),
        )
        .await
        .unwrap();

    let result = registry
        .checkpoints
        .search(&cancel, &tenant, "how did I implement auth?", Some(3), &[])
        .await
        .unwrap();

    assert_eq!(result.top_k, 3);
    assert!(
        result.hits.iter().any(|h| h.checkpoint.id == saved.id),
        "saved checkpoint must be retrievable by a related query"
    );
    assert_eq!(result.hits[0].checkpoint.id, saved.id);
    assert!(result.hits[0].score > 0.0);
}

#[tokio::test]
async fn save_then_list_read_your_writes() {
    let registry = registry();
    let cancel = CancellationToken::new();
    let tenant = registry.tenant_for_path("/p").unwrap();

    registry
        .checkpoints
        .save(&cancel, &tenant, save_request("first", "one", &[]))
        .await
        .unwrap();
    let newest = registry
        .checkpoints
        .save(&cancel, &tenant, save_request("second", "two", &[]))
        .await
        .unwrap();

    let listed = registry
        .checkpoints
        .list(&cancel, &tenant, ListRequest::default())
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);
    // The write just issued must lead the list.
    assert_eq!(listed[0].id, newest.id);
}

#[tokio::test]
async fn list_tag_filter_is_and() {
    let registry = registry();
    let cancel = CancellationToken::new();
    let tenant = registry.tenant_for_path("/p").unwrap();

    registry
        .checkpoints
        .save(&cancel, &tenant, save_request("a", "x", &["auth"]))
        .await
        .unwrap();
    registry
        .checkpoints
        .save(&cancel, &tenant, save_request("b", "y", &["auth", "db"]))
        .await
        .unwrap();

    let both = registry
        .checkpoints
        .list(
            &cancel,
            &tenant,
            ListRequest {
                tags: vec!["auth".to_string(), "db".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(both.len(), 1);
    assert_eq!(both[0].summary, "b");
}

#[tokio::test]
async fn cross_project_isolation() {
    let registry = registry();
    registry
        .store
        .set_isolation_mode(IsolationMode::CollectionPerProject);
    let cancel = CancellationToken::new();
    let p1 = registry.tenant_for_path("/p1").unwrap();
    let p2 = registry.tenant_for_path("/p2").unwrap();

    registry
        .checkpoints
        .save(
            &cancel,
            &p1,
            save_request("implemented jwt auth", "refresh tokens", &[]),
        )
        .await
        .unwrap();

    // Identical query under the other project returns zero results.
    let result = registry
        .checkpoints
        .search(&cancel, &p2, "implemented jwt auth", Some(5), &[])
        .await
        .unwrap();
    assert!(result.hits.is_empty());
}

#[tokio::test]
async fn threshold_auto_save_shape() {
    let registry = registry();
    let cancel = CancellationToken::new();
    let tenant = registry.tenant_for_project_id("t");

    let summary = "long ".repeat(20); // 100 chars
    let checkpoint = registry
        .checkpoints
        .save_on_threshold(
            &cancel,
            &tenant,
            ThresholdRequest {
                session_id: "s".to_string(),
                project_id: "t".to_string(),
                percent: 70,
                summary: Some(summary.clone()),
                context: None,
            },
        )
        .await
        .unwrap();

    let expected_name: String = summary.chars().take(47).collect::<String>() + "...";
    assert_eq!(checkpoint.name, expected_name);
    assert!(checkpoint.tags.contains(&"auto-save".to_string()));
    assert_eq!(checkpoint.metadata.get("trigger").unwrap(), "threshold");
    assert!(checkpoint.auto_created);
    assert!((checkpoint.threshold - 0.7).abs() < 1e-9);

    // Fetchable afterwards.
    let fetched = registry
        .checkpoints
        .get(&cancel, &tenant, &checkpoint.id)
        .await
        .unwrap();
    assert_eq!(fetched.name, checkpoint.name);
}

#[tokio::test]
async fn threshold_rejects_bad_input() {
    let registry = registry();
    let cancel = CancellationToken::new();
    let tenant = registry.tenant_for_project_id("t");

    let err = registry
        .checkpoints
        .save_on_threshold(
            &cancel,
            &tenant,
            ThresholdRequest {
                session_id: "s".to_string(),
                project_id: "../escape".to_string(),
                percent: 70,
                summary: None,
                context: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");

    let err = registry
        .checkpoints
        .save_on_threshold(
            &cancel,
            &tenant,
            ThresholdRequest {
                session_id: "s".to_string(),
                project_id: "t".to_string(),
                percent: 0,
                summary: None,
                context: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn delete_then_get_is_not_found() {
    let registry = registry();
    let cancel = CancellationToken::new();
    let tenant = registry.tenant_for_path("/p").unwrap();

    let saved = registry
        .checkpoints
        .save(&cancel, &tenant, save_request("temp", "temp", &[]))
        .await
        .unwrap();
    registry
        .checkpoints
        .delete(&cancel, &tenant, &saved.id)
        .await
        .unwrap();
    let err = registry
        .checkpoints
        .get(&cancel, &tenant, &saved.id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[tokio::test]
async fn resume_formats_recent_checkpoints() {
    let registry = registry();
    let cancel = CancellationToken::new();
    let tenant = registry.tenant_for_path("/p").unwrap();

    for i in 0..5 {
        registry
            .checkpoints
            .save(
                &cancel,
                &tenant,
                save_request(&format!("step {i}"), "details", &[]),
            )
            .await
            .unwrap();
    }

    let block = registry
        .checkpoints
        .resume(&cancel, &tenant, None)
        .await
        .unwrap();
    assert!(block.starts_with("Recent checkpoints:"));
    // Default resume depth is 3.
    assert_eq!(block.lines().count(), 4);
    // Every entry carries a score; the newest one scores 1.0.
    for line in block.lines().skip(1) {
        assert!(line.contains("(score "), "missing score in: {line}");
    }
    assert!(block.lines().nth(1).unwrap().contains("(score 1.00)"));
}
