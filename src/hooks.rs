// src/hooks.rs
// Lifecycle event bus: session_start / before_clear / after_clear /
// context_threshold / session_end, with ordered custom handlers and
// built-in orchestration across checkpoint, distiller, and bank.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointService, SaveRequest};
use crate::config::HooksConfigHandle;
use crate::error::{ContextdError, Result};
use crate::identity::TenantInfo;
use crate::reasoning::{Distiller, ReasoningBank};

/// Event payload: string keys to arbitrary JSON.
pub type HookPayload = serde_json::Map<String, Value>;

/// Lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    SessionStart,
    BeforeClear,
    AfterClear,
    ContextThreshold,
    SessionEnd,
}

impl HookKind {
    pub const ALL: [HookKind; 5] = [
        HookKind::SessionStart,
        HookKind::BeforeClear,
        HookKind::AfterClear,
        HookKind::ContextThreshold,
        HookKind::SessionEnd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::SessionStart => "session_start",
            HookKind::BeforeClear => "before_clear",
            HookKind::AfterClear => "after_clear",
            HookKind::ContextThreshold => "context_threshold",
            HookKind::SessionEnd => "session_end",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "session_start" => Some(HookKind::SessionStart),
            "before_clear" => Some(HookKind::BeforeClear),
            "after_clear" => Some(HookKind::AfterClear),
            "context_threshold" => Some(HookKind::ContextThreshold),
            "session_end" => Some(HookKind::SessionEnd),
            _ => None,
        }
    }
}

/// One in-flight event.
#[derive(Debug, Clone)]
pub struct HookEvent {
    pub kind: HookKind,
    pub payload: HookPayload,
}

/// Custom handler contract. Handlers receive the event by value and return
/// it (possibly mutated); they run on their own task so a panic is
/// contained.
#[async_trait]
pub trait HookHandler: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn handle(&self, event: HookEvent) -> anyhow::Result<HookEvent>;
}

/// Handler that merges fixed keys into the payload. This is what
/// `hook_register` over RPC creates; hosts use it to e.g. approve clears.
pub struct SetterHandler {
    name: String,
    updates: HookPayload,
}

impl SetterHandler {
    pub fn new(name: String, updates: HookPayload) -> Self {
        Self { name, updates }
    }
}

#[async_trait]
impl HookHandler for SetterHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, mut event: HookEvent) -> anyhow::Result<HookEvent> {
        for (key, value) in &self.updates {
            event.payload.insert(key.clone(), value.clone());
        }
        Ok(event)
    }
}

struct Registration {
    kind: HookKind,
    handler: Arc<dyn HookHandler>,
}

/// The event bus. Custom handlers run in registration order, before the
/// built-ins; the handler list is copy-on-write so emits never hold a lock
/// across awaits.
pub struct HookManager {
    config: Arc<HooksConfigHandle>,
    handlers: RwLock<Arc<Vec<Registration>>>,
    checkpoints: Arc<CheckpointService>,
    bank: Arc<ReasoningBank>,
    distiller: Arc<Distiller>,
}

impl HookManager {
    pub fn new(
        config: Arc<HooksConfigHandle>,
        checkpoints: Arc<CheckpointService>,
        bank: Arc<ReasoningBank>,
        distiller: Arc<Distiller>,
    ) -> Self {
        Self {
            config,
            handlers: RwLock::new(Arc::new(Vec::new())),
            checkpoints,
            bank,
            distiller,
        }
    }

    /// Register a custom handler for one event kind.
    pub fn register(&self, kind: HookKind, handler: Arc<dyn HookHandler>) {
        let mut guard = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next: Vec<Registration> = guard
            .iter()
            .map(|r| Registration {
                kind: r.kind,
                handler: r.handler.clone(),
            })
            .collect();
        info!("Registered hook handler '{}' for {}", handler.name(), kind.as_str());
        next.push(Registration { kind, handler });
        *guard = Arc::new(next);
    }

    pub fn handler_count(&self, kind: HookKind) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|r| r.kind == kind)
            .count()
    }

    /// Emit an event: custom handlers in order, then the built-in for the
    /// kind. Returns the final payload.
    pub async fn emit(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        kind: HookKind,
        mut payload: HookPayload,
    ) -> Result<HookPayload> {
        let snapshot = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for registration in snapshot.iter().filter(|r| r.kind == kind) {
            if cancel.is_cancelled() {
                return Err(ContextdError::Cancelled);
            }
            let handler = registration.handler.clone();
            let name = handler.name().to_string();
            let event = HookEvent {
                kind,
                payload: payload.clone(),
            };
            // Run on a separate task so a panicking handler is recovered
            // through the join error instead of unwinding the emit.
            let joined = tokio::spawn(async move { handler.handle(event).await }).await;
            match joined {
                Ok(Ok(event)) => payload = event.payload,
                Ok(Err(e)) => {
                    warn!("Hook handler '{}' failed: {e:#}", name);
                    attach_error(&mut payload, &name, &format!("{e:#}"));
                }
                Err(join_err) => {
                    error!("Hook handler '{}' panicked: {join_err}", name);
                    attach_error(&mut payload, &name, "INTERNAL_ERROR: handler panicked");
                }
            }
        }

        self.run_builtin(cancel, tenant, kind, payload).await
    }

    async fn run_builtin(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        kind: HookKind,
        mut payload: HookPayload,
    ) -> Result<HookPayload> {
        let config = self.config.current();
        match kind {
            HookKind::SessionStart => {
                if config.auto_resume_on_start {
                    match self.checkpoints.resume(cancel, tenant, None).await {
                        Ok(block) => {
                            payload.insert("resume_context".to_string(), block.into());
                        }
                        Err(e) => {
                            // Session start must never fail on resume.
                            warn!("Resume failed at session start: {e}");
                            payload.insert("resume_error".to_string(), e.to_user_string().into());
                        }
                    }
                }
            }
            HookKind::BeforeClear => {
                if config.verify_before_clear {
                    let approved = payload
                        .get("clear_approved")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    if !approved {
                        return Err(ContextdError::validation(
                            "clear_approved",
                            "no handler approved the clear",
                        ));
                    }
                }
                if config.auto_checkpoint_on_clear {
                    // Failures here block the clear, by contract.
                    let checkpoint = self
                        .checkpoints
                        .save(cancel, tenant, before_clear_request(&payload, &config))
                        .await?;
                    payload.insert("checkpoint_id".to_string(), checkpoint.id.into());
                }
            }
            HookKind::AfterClear => {
                debug!("after_clear for project {}", tenant.project_id);
            }
            HookKind::ContextThreshold => {
                // The threshold entry point already saved the checkpoint;
                // nothing more to do here.
                debug!(
                    "context_threshold for project {} (checkpoint {:?})",
                    tenant.project_id,
                    payload.get("checkpoint_id")
                );
            }
            HookKind::SessionEnd => {
                self.distill_session(cancel, tenant, &mut payload).await;
            }
        }
        Ok(payload)
    }

    /// Best-effort session-end distillation. Errors are logged and noted
    /// in the payload, never propagated.
    async fn distill_session(
        &self,
        cancel: &CancellationToken,
        tenant: &TenantInfo,
        payload: &mut HookPayload,
    ) {
        let Some(path) = payload
            .get("transcript_path")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
        else {
            debug!("session_end without transcript_path; nothing to distill");
            return;
        };

        let messages = match crate::transcript::parse_session_file(&path) {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Could not read transcript {}: {e}", path.display());
                attach_error(payload, "distill", &format!("transcript: {e}"));
                return;
            }
        };

        let since = payload
            .get("last_checkpoint_at")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let drafts = match self.distiller.distill(cancel, &messages, since).await {
            Ok(drafts) => drafts,
            Err(e) => {
                warn!("Distillation failed: {e}");
                attach_error(payload, "distill", &e.to_user_string());
                return;
            }
        };

        let mut recorded = 0usize;
        for draft in drafts {
            match self.bank.record(cancel, tenant, draft).await {
                Ok(_) => recorded += 1,
                Err(e) => {
                    warn!("Failed to record distilled memory: {e}");
                    attach_error(payload, "record_memory", &e.to_user_string());
                }
            }
        }
        if recorded > 0 {
            info!("Recorded {recorded} memories at session end");
        }
        payload.insert("memories_recorded".to_string(), recorded.into());
    }
}

fn before_clear_request(
    payload: &HookPayload,
    config: &crate::config::HooksConfig,
) -> SaveRequest {
    let str_field = |key: &str| {
        payload
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    SaveRequest {
        session_id: str_field("session_id"),
        name: format!("Auto-checkpoint before /clear at {}", Utc::now().format("%H:%M:%S")),
        description: "Automatic checkpoint taken before clearing context".to_string(),
        summary: str_field("summary"),
        context: str_field("context"),
        token_count: 0,
        threshold: f64::from(config.checkpoint_threshold_percent) / 100.0,
        auto_created: true,
        tags: vec!["auto-save".to_string(), "before-clear".to_string()],
        metadata: HashMap::from([("trigger".to_string(), "before_clear".to_string())]),
    }
}

fn attach_error(payload: &mut HookPayload, source: &str, message: &str) {
    let errors = payload
        .entry("hook_errors".to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(list) = errors {
        list.push(Value::String(format!("{source}: {message}")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HooksConfig;
    use crate::embeddings::EmbeddingClient;
    use crate::scrub::Scrubber;
    use crate::store::{InMemoryBackend, VectorStoreFacade};
    use serde_json::json;

    fn setup(config: HooksConfig) -> (Arc<HookManager>, Arc<CheckpointService>, TenantInfo) {
        let scrubber = Arc::new(Scrubber::new());
        let store = Arc::new(VectorStoreFacade::new(
            Arc::new(InMemoryBackend::new()),
            Arc::new(EmbeddingClient::local(64)),
            scrubber.clone(),
        ));
        let checkpoints = Arc::new(CheckpointService::new(store.clone()));
        let bank = Arc::new(ReasoningBank::new(store.clone(), scrubber.clone()));
        let distiller = Arc::new(Distiller::new(None, scrubber));
        let hooks = Arc::new(HookManager::new(
            Arc::new(HooksConfigHandle::new(config)),
            checkpoints.clone(),
            bank,
            distiller,
        ));
        checkpoints.set_hook_manager(hooks.clone());
        (hooks, checkpoints, TenantInfo::for_path("acme", None, "/project"))
    }

    fn payload(value: Value) -> HookPayload {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_session_start_resume_context() {
        let (hooks, checkpoints, tenant) = setup(HooksConfig::default());
        let cancel = CancellationToken::new();

        checkpoints
            .save(
                &cancel,
                &tenant,
                SaveRequest {
                    session_id: "s1".to_string(),
                    name: "auth work".to_string(),
                    summary: "implemented jwt auth".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let result = hooks
            .emit(&cancel, &tenant, HookKind::SessionStart, HookPayload::new())
            .await
            .unwrap();
        let block = result.get("resume_context").and_then(|v| v.as_str()).unwrap();
        assert!(block.contains("auth work"));
        assert!(result.get("resume_error").is_none());
    }

    #[tokio::test]
    async fn test_before_clear_requires_approval() {
        let (hooks, _, tenant) = setup(HooksConfig::default());
        let cancel = CancellationToken::new();

        let err = hooks
            .emit(&cancel, &tenant, HookKind::BeforeClear, HookPayload::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let ok = hooks
            .emit(
                &cancel,
                &tenant,
                HookKind::BeforeClear,
                payload(json!({"clear_approved": true})),
            )
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_before_clear_auto_checkpoint() {
        let mut config = HooksConfig::default();
        config.auto_checkpoint_on_clear = true;
        config.verify_before_clear = false;
        let (hooks, checkpoints, tenant) = setup(config);
        let cancel = CancellationToken::new();

        let result = hooks
            .emit(
                &cancel,
                &tenant,
                HookKind::BeforeClear,
                payload(json!({"session_id": "s1", "summary": "pre-clear state"})),
            )
            .await
            .unwrap();
        let id = result.get("checkpoint_id").and_then(|v| v.as_str()).unwrap();

        let saved = checkpoints.get(&cancel, &tenant, id).await.unwrap();
        assert!(saved.auto_created);
        assert!(saved.tags.contains(&"auto-save".to_string()));
        assert!(saved.tags.contains(&"before-clear".to_string()));
        assert!(saved.name.starts_with("Auto-checkpoint before /clear at "));
    }

    #[tokio::test]
    async fn test_setter_handler_approves_clear() {
        let (hooks, _, tenant) = setup(HooksConfig::default());
        let cancel = CancellationToken::new();

        hooks.register(
            HookKind::BeforeClear,
            Arc::new(SetterHandler::new(
                "approver".to_string(),
                payload(json!({"clear_approved": true})),
            )),
        );
        assert_eq!(hooks.handler_count(HookKind::BeforeClear), 1);

        let result = hooks
            .emit(&cancel, &tenant, HookKind::BeforeClear, HookPayload::new())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_handler_panic_recovered() {
        struct PanickingHandler;

        #[async_trait]
        impl HookHandler for PanickingHandler {
            fn name(&self) -> &str {
                "panicker"
            }
            async fn handle(&self, _event: HookEvent) -> anyhow::Result<HookEvent> {
                panic!("boom");
            }
        }

        let (hooks, _, tenant) = setup(HooksConfig::default());
        let cancel = CancellationToken::new();
        hooks.register(HookKind::AfterClear, Arc::new(PanickingHandler));

        let result = hooks
            .emit(&cancel, &tenant, HookKind::AfterClear, HookPayload::new())
            .await
            .unwrap();
        let errors = result.get("hook_errors").and_then(|v| v.as_array()).unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].as_str().unwrap().contains("INTERNAL_ERROR"));
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let (hooks, _, tenant) = setup(HooksConfig::default());
        let cancel = CancellationToken::new();

        hooks.register(
            HookKind::AfterClear,
            Arc::new(SetterHandler::new("first".to_string(), payload(json!({"who": "first"})))),
        );
        hooks.register(
            HookKind::AfterClear,
            Arc::new(SetterHandler::new("second".to_string(), payload(json!({"who": "second"})))),
        );

        let result = hooks
            .emit(&cancel, &tenant, HookKind::AfterClear, HookPayload::new())
            .await
            .unwrap();
        // Later registration wins the overwrite.
        assert_eq!(result.get("who").and_then(|v| v.as_str()), Some("second"));
    }

    #[tokio::test]
    async fn test_session_end_without_transcript_is_noop() {
        let (hooks, _, tenant) = setup(HooksConfig::default());
        let cancel = CancellationToken::new();
        let result = hooks
            .emit(&cancel, &tenant, HookKind::SessionEnd, HookPayload::new())
            .await
            .unwrap();
        assert!(result.get("memories_recorded").is_none());
    }

    #[tokio::test]
    async fn test_resume_disabled_by_config() {
        let mut config = HooksConfig::default();
        config.auto_resume_on_start = false;
        let (hooks, _, tenant) = setup(config);
        let cancel = CancellationToken::new();
        let result = hooks
            .emit(&cancel, &tenant, HookKind::SessionStart, HookPayload::new())
            .await
            .unwrap();
        assert!(result.get("resume_context").is_none());
    }
}
