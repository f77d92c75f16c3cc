// src/registry.rs
// Service registry: builds and owns the shared handles and component
// services, and exposes them to the MCP and HTTP transports.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::checkpoint::CheckpointService;
use crate::config::{Config, HooksConfigHandle};
use crate::embeddings::EmbeddingClient;
use crate::error::Result;
use crate::hooks::HookManager;
use crate::identity::TenantInfo;
use crate::llm::{AiClient, OpenAiChatClient};
use crate::reasoning::{Distiller, ReasoningBank};
use crate::reflect::ReflectionEngine;
use crate::scrub::Scrubber;
use crate::store::{InMemoryBackend, QdrantBackend, VectorBackend, VectorStoreFacade};
use crate::troubleshoot::Troubleshooter;

/// Availability snapshot for `/api/v1/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub embedder: String,
    pub embedder_external: bool,
    pub ai_available: bool,
    pub scrubber_enabled: bool,
    pub isolation_mode: String,
    pub collections: Vec<CollectionStatusEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStatusEntry {
    pub name: String,
    pub point_count: u64,
}

/// Owns every component. Components depend only on the store facade,
/// embedder and scrubber seams, never on each other's concrete types; the
/// hook manager is the one cross-component orchestrator.
pub struct ServiceRegistry {
    pub config: Config,
    pub hooks_config: Arc<HooksConfigHandle>,
    pub scrubber: Arc<Scrubber>,
    pub embedder: Arc<EmbeddingClient>,
    pub store: Arc<VectorStoreFacade>,
    pub checkpoints: Arc<CheckpointService>,
    pub bank: Arc<ReasoningBank>,
    pub distiller: Arc<Distiller>,
    pub reflection: Arc<ReflectionEngine>,
    pub troubleshooter: Arc<Troubleshooter>,
    pub hooks: Arc<HookManager>,
    ai_available: bool,
}

impl ServiceRegistry {
    /// Wire everything against the Qdrant backend from config.
    pub fn connect(config: Config) -> Result<Self> {
        let backend: Arc<dyn VectorBackend> =
            Arc::new(QdrantBackend::connect(&config.qdrant_url)?);
        info!("Using Qdrant vector store at {}", config.qdrant_url);
        Ok(Self::build(config, backend))
    }

    /// Wire everything against the in-memory backend with the local
    /// embedder and no AI client (tests, `--memory`).
    pub fn in_memory(config: Config) -> Self {
        let embedder = Arc::new(EmbeddingClient::local(config.embedding_dim));
        Self::build_with(config, Arc::new(InMemoryBackend::new()), embedder, None)
    }

    pub fn build(config: Config, backend: Arc<dyn VectorBackend>) -> Self {
        let http_client = crate::http::create_shared_client();
        let embedder = Arc::new(EmbeddingClient::from_env(
            config.embedding_dim,
            http_client.clone(),
        ));
        let ai: Option<Arc<dyn AiClient>> =
            OpenAiChatClient::from_env(http_client).map(|c| Arc::new(c) as Arc<dyn AiClient>);
        Self::build_with(config, backend, embedder, ai)
    }

    fn build_with(
        config: Config,
        backend: Arc<dyn VectorBackend>,
        embedder: Arc<EmbeddingClient>,
        ai: Option<Arc<dyn AiClient>>,
    ) -> Self {
        let scrubber = Arc::new(if config.scrub_enabled {
            Scrubber::new().with_replacement(&config.scrub_replacement)
        } else {
            Scrubber::disabled()
        });
        let ai_available = ai.is_some();

        let store = Arc::new(VectorStoreFacade::new(
            backend,
            embedder.clone(),
            scrubber.clone(),
        ));

        let hooks_config = Arc::new(HooksConfigHandle::new(config.hooks.clone()));
        let checkpoints = Arc::new(CheckpointService::new(store.clone()));
        let bank = Arc::new(ReasoningBank::new(store.clone(), scrubber.clone()));
        let distiller = Arc::new(Distiller::new(ai.clone(), scrubber.clone()));
        let reflection = Arc::new(ReflectionEngine::new(bank.clone()));
        let troubleshooter = Arc::new(Troubleshooter::new(store.clone(), ai));
        let hooks = Arc::new(HookManager::new(
            hooks_config.clone(),
            checkpoints.clone(),
            bank.clone(),
            distiller.clone(),
        ));
        checkpoints.set_hook_manager(hooks.clone());

        Self {
            config,
            hooks_config,
            scrubber,
            embedder,
            store,
            checkpoints,
            bank,
            distiller,
            reflection,
            troubleshooter,
            hooks,
            ai_available,
        }
    }

    /// Caller identity for a project path.
    pub fn tenant_for_path(&self, project_path: &str) -> Result<TenantInfo> {
        crate::identity::validate_path(project_path, None)?;
        Ok(TenantInfo::for_path(
            &self.config.tenant_id,
            self.config.team_id.as_deref(),
            project_path,
        ))
    }

    /// Caller identity for an already-derived project id (host hooks pass
    /// these directly).
    pub fn tenant_for_project_id(&self, project_id: &str) -> TenantInfo {
        TenantInfo::new(
            &self.config.tenant_id,
            self.config.team_id.as_deref(),
            &crate::identity::sanitize_identifier(project_id),
        )
    }

    /// Per-service availability plus collection counts.
    pub async fn status(&self, cancel: &CancellationToken) -> Result<StatusReport> {
        let names = self.store.list_collections(cancel).await?;
        let mut collections = Vec::with_capacity(names.len());
        for name in names {
            let point_count = self
                .store
                .collection_info(cancel, &name)
                .await
                .map(|info| info.point_count)
                .unwrap_or(0);
            collections.push(CollectionStatusEntry { name, point_count });
        }
        Ok(StatusReport {
            embedder: self.embedder.provider_id().to_string(),
            embedder_external: self.embedder.is_external(),
            ai_available: self.ai_available,
            scrubber_enabled: self.scrubber.is_enabled(),
            isolation_mode: self.store.isolation_mode().as_str().to_string(),
            collections,
        })
    }
}
