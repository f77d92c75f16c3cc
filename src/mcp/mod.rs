// src/mcp/mod.rs
// MCP server: one tool per RPC surface method

mod requests;

use std::sync::Arc;

use rmcp::{
    ErrorData, ServerHandler,
    handler::server::{router::tool::ToolRouter, tool::ToolCallContext, wrapper::Parameters},
    model::{
        CallToolRequestParam, CallToolResult, Content, ListToolsResult, PaginatedRequestParam,
        ServerCapabilities, ServerInfo,
    },
    service::{RequestContext, RoleServer},
    tool, tool_router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{ListRequest, SaveRequest};
use crate::error::Result;
use crate::hooks::{HookKind, SetterHandler};
use crate::identity::TenantInfo;
use crate::reasoning::{MemoryDraft, Outcome};
use crate::reflect::{AnalyzeOptions, CorrelateOptions, CorrelationType, ReportFormat};
use crate::registry::ServiceRegistry;
use requests::*;

/// MCP server state
#[derive(Clone)]
pub struct ContextdServer {
    registry: Arc<ServiceRegistry>,
    tool_router: ToolRouter<Self>,
}

impl ContextdServer {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            tool_router: Self::tool_router(),
        }
    }

    fn tenant(&self, project_path: Option<&str>) -> Result<TenantInfo> {
        match project_path {
            Some(path) => self.registry.tenant_for_path(path),
            None => {
                let cwd = std::env::current_dir()
                    .map_err(|e| crate::error::ContextdError::Internal(e.to_string()))?;
                self.registry.tenant_for_path(&cwd.to_string_lossy())
            }
        }
    }
}

/// Serialize a tool result as pretty JSON; errors become tool errors with
/// their stable code, never a protocol failure.
fn tool_result<T: Serialize>(result: Result<T>) -> std::result::Result<CallToolResult, ErrorData> {
    match result {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(json) => Ok(CallToolResult::success(vec![Content::text(json)])),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "INTERNAL_ERROR: {e}"
            ))])),
        },
        Err(e) => Ok(CallToolResult::error(vec![Content::text(
            e.to_user_string(),
        )])),
    }
}

#[tool_router]
impl ContextdServer {
    #[tool(
        description = "Save a checkpoint of the current session state. Provide a summary and description; they drive later semantic retrieval."
    )]
    async fn checkpoint_save(
        &self,
        Parameters(req): Parameters<CheckpointSaveRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let cancel = CancellationToken::new();
        let result = async {
            let tenant = self.tenant(Some(&req.project_path))?;
            self.registry
                .checkpoints
                .save(
                    &cancel,
                    &tenant,
                    SaveRequest {
                        session_id: req.session_id.unwrap_or_default(),
                        name: crate::identity::safe_basename(&req.project_path)
                            .unwrap_or_else(|_| "checkpoint".to_string())
                            .chars()
                            .take(50)
                            .collect(),
                        description: req.description,
                        summary: req.summary,
                        context: req.context.unwrap_or_default(),
                        tags: req.tags.unwrap_or_default(),
                        ..Default::default()
                    },
                )
                .await
        }
        .await;
        tool_result(result)
    }

    #[tool(description = "Semantic search over saved checkpoints for this project.")]
    async fn checkpoint_search(
        &self,
        Parameters(req): Parameters<CheckpointSearchRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let cancel = CancellationToken::new();
        let result = async {
            let tenant = self.tenant(req.project_path.as_deref())?;
            self.registry
                .checkpoints
                .search(
                    &cancel,
                    &tenant,
                    &req.query,
                    req.top_k,
                    &req.tags.unwrap_or_default(),
                )
                .await
        }
        .await;
        tool_result(result)
    }

    #[tool(description = "List saved checkpoints for this project, newest first.")]
    async fn checkpoint_list(
        &self,
        Parameters(req): Parameters<CheckpointListRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let cancel = CancellationToken::new();
        let result = async {
            let tenant = self.tenant(req.project_path.as_deref())?;
            self.registry
                .checkpoints
                .list(
                    &cancel,
                    &tenant,
                    ListRequest {
                        limit: req.limit,
                        offset: req.offset.unwrap_or(0),
                        tags: req.tags.unwrap_or_default(),
                    },
                )
                .await
        }
        .await;
        tool_result(result)
    }

    #[tool(
        description = "Resume context: the most recent checkpoints for this project formatted as a short block."
    )]
    async fn checkpoint_resume(
        &self,
        Parameters(req): Parameters<CheckpointResumeRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let cancel = CancellationToken::new();
        let result = async {
            let tenant = self.tenant(Some(&req.project_path))?;
            self.registry.checkpoints.resume(&cancel, &tenant, None).await
        }
        .await;
        tool_result(result)
    }

    #[tool(description = "Record a durable memory (a distilled learning) for this project.")]
    async fn memory_record(
        &self,
        Parameters(req): Parameters<MemoryRecordRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let cancel = CancellationToken::new();
        let result = async {
            let tenant = self.tenant(Some(&req.project_path))?;
            self.registry
                .bank
                .record(
                    &cancel,
                    &tenant,
                    MemoryDraft {
                        title: req.title,
                        content: req.content,
                        tags: req.tags.unwrap_or_default(),
                        outcome: req
                            .outcome
                            .as_deref()
                            .map(Outcome::parse)
                            .unwrap_or_default(),
                        confidence: req.confidence,
                    },
                )
                .await
        }
        .await;
        tool_result(result)
    }

    #[tool(description = "Semantic recall over this project's memories.")]
    async fn memory_search(
        &self,
        Parameters(req): Parameters<MemorySearchRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let cancel = CancellationToken::new();
        let result = async {
            let tenant = self.tenant(Some(&req.project_path))?;
            self.registry
                .bank
                .search(&cancel, &tenant, &req.query, req.limit.unwrap_or(5))
                .await
        }
        .await;
        tool_result(result)
    }

    #[tool(description = "Mark a recalled memory as helpful or unhelpful.")]
    async fn memory_feedback(
        &self,
        Parameters(req): Parameters<MemoryFeedbackRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let cancel = CancellationToken::new();
        let result = async {
            let tenant = self.tenant(Some(&req.project_path))?;
            self.registry
                .bank
                .feedback(&cancel, &tenant, &req.id, req.helpful)
                .await
        }
        .await;
        tool_result(result)
    }

    #[tool(
        description = "Record whether applying a memory succeeded. Updates its confidence and outcome label."
    )]
    async fn memory_outcome(
        &self,
        Parameters(req): Parameters<MemoryOutcomeRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let cancel = CancellationToken::new();
        let result = async {
            let tenant = self.tenant(Some(&req.project_path))?;
            let confidence = self
                .registry
                .bank
                .record_outcome(&cancel, &tenant, &req.id, req.succeeded, &req.session_id)
                .await?;
            Ok(serde_json::json!({"id": req.id, "new_confidence": confidence}))
        }
        .await;
        tool_result(result)
    }

    #[tool(
        description = "Diagnose an error message against the team's known error patterns, with AI hypothesis generation when no pattern matches."
    )]
    async fn troubleshoot_diagnose(
        &self,
        Parameters(req): Parameters<TroubleshootRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let cancel = CancellationToken::new();
        let result = async {
            let tenant = self.tenant(req.project_path.as_deref())?;
            self.registry
                .troubleshooter
                .diagnose(&cancel, &tenant, &req.error_message, req.context.as_deref())
                .await
        }
        .await;
        tool_result(result)
    }

    #[tool(description = "Analyze this project's memories into recurring patterns.")]
    async fn reflect_analyze(
        &self,
        Parameters(req): Parameters<ReflectAnalyzeRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let cancel = CancellationToken::new();
        let result = async {
            let tenant = self.tenant(Some(&req.project_path))?;
            let options = analyze_options(
                req.min_confidence,
                req.min_frequency,
                req.max_patterns,
                req.include_tags,
                req.exclude_tags,
            );
            self.registry
                .reflection
                .analyze(&cancel, &tenant, &options)
                .await
        }
        .await;
        tool_result(result)
    }

    #[tool(description = "Correlate this project's reflection patterns with each other.")]
    async fn reflect_correlate(
        &self,
        Parameters(req): Parameters<ReflectCorrelateRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let cancel = CancellationToken::new();
        let result = async {
            let tenant = self.tenant(Some(&req.project_path))?;
            let patterns = self
                .registry
                .reflection
                .analyze(&cancel, &tenant, &AnalyzeOptions::default())
                .await?;
            let options = CorrelateOptions {
                types: parse_correlation_types(req.types),
                min_strength: req.min_strength.unwrap_or(0.3),
                max: req.max.unwrap_or(50),
            };
            self.registry.reflection.correlate(&cancel, &patterns, &options)
        }
        .await;
        tool_result(result)
    }

    #[tool(
        description = "Full reflection report: patterns, correlations, insights, recommendations. JSON is canonical; text and markdown renderings available."
    )]
    async fn reflect_report(
        &self,
        Parameters(req): Parameters<ReflectReportRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let cancel = CancellationToken::new();
        let result: Result<String> = async {
            let tenant = self.tenant(Some(&req.project_path))?;
            let report = self
                .registry
                .reflection
                .generate(
                    &cancel,
                    &tenant,
                    &AnalyzeOptions::default(),
                    &CorrelateOptions::default(),
                )
                .await?;
            let format = match req.format.as_deref() {
                Some("text") => ReportFormat::Text,
                Some("markdown") => ReportFormat::Markdown,
                _ => ReportFormat::Json,
            };
            report.render(format)
        }
        .await;
        match result {
            Ok(rendered) => Ok(CallToolResult::success(vec![Content::text(rendered)])),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(
                e.to_user_string(),
            )])),
        }
    }

    #[tool(
        description = "Register a payload-setting hook handler for a lifecycle event (e.g. approve clears by setting clear_approved)."
    )]
    async fn hook_register(
        &self,
        Parameters(req): Parameters<HookRegisterRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let result: Result<serde_json::Value> = (|| {
            let kind = HookKind::parse(&req.kind).ok_or_else(|| {
                crate::error::ContextdError::validation("kind", "unknown hook kind")
            })?;
            self.registry.hooks.register(
                kind,
                Arc::new(SetterHandler::new(req.name.clone(), req.set.unwrap_or_default())),
            );
            Ok(serde_json::json!({
                "registered": req.name,
                "kind": kind.as_str(),
                "handlers": self.registry.hooks.handler_count(kind),
            }))
        })();
        tool_result(result)
    }

    #[tool(description = "Emit a lifecycle event and return the final payload.")]
    async fn hook_emit(
        &self,
        Parameters(req): Parameters<HookEmitRequest>,
    ) -> std::result::Result<CallToolResult, ErrorData> {
        let cancel = CancellationToken::new();
        let result = async {
            let kind = HookKind::parse(&req.kind).ok_or_else(|| {
                crate::error::ContextdError::validation("kind", "unknown hook kind")
            })?;
            let tenant = self.tenant(Some(&req.project_path))?;
            self.registry
                .hooks
                .emit(&cancel, &tenant, kind, req.payload.unwrap_or_default())
                .await
        }
        .await;
        tool_result(result)
    }
}

fn analyze_options(
    min_confidence: Option<f64>,
    min_frequency: Option<usize>,
    max_patterns: Option<usize>,
    include_tags: Option<Vec<String>>,
    exclude_tags: Option<Vec<String>>,
) -> AnalyzeOptions {
    let defaults = AnalyzeOptions::default();
    AnalyzeOptions {
        min_confidence: min_confidence.unwrap_or(defaults.min_confidence),
        min_frequency: min_frequency.unwrap_or(defaults.min_frequency),
        period: None,
        include_tags: include_tags.unwrap_or_default(),
        exclude_tags: exclude_tags.unwrap_or_default(),
        max_patterns: max_patterns.unwrap_or(defaults.max_patterns),
    }
}

fn parse_correlation_types(types: Option<Vec<String>>) -> Vec<CorrelationType> {
    let Some(types) = types else {
        return CorrelationType::all().to_vec();
    };
    let parsed: Vec<CorrelationType> = types
        .iter()
        .filter_map(|t| match t.as_str() {
            "similar" => Some(CorrelationType::Similar),
            "co_occurs" => Some(CorrelationType::CoOccurs),
            "opposite" => Some(CorrelationType::Opposite),
            "sequential" => Some(CorrelationType::Sequential),
            _ => None,
        })
        .collect();
    if parsed.is_empty() {
        CorrelationType::all().to_vec()
    } else {
        parsed
    }
}

impl ServerHandler for ContextdServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: rmcp::model::Implementation {
                name: "contextd".into(),
                title: Some("contextd - Context management for AI coding assistants".into()),
                version: env!("CARGO_PKG_VERSION").into(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "contextd keeps session knowledge across context clears: checkpoints, \
                 distilled memories, error diagnosis, and reflection over past sessions."
                    .into(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = std::result::Result<ListToolsResult, ErrorData>> + Send + '_
    {
        std::future::ready(Ok(ListToolsResult {
            tools: self.tool_router.list_all(),
            next_cursor: None,
            meta: None,
        }))
    }

    #[allow(clippy::manual_async_fn)]
    fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = std::result::Result<CallToolResult, ErrorData>> + Send + '_
    {
        async move {
            let ctx = ToolCallContext::new(self, request, context);
            self.tool_router.call(ctx).await
        }
    }
}

/// Run the MCP server over stdio until the transport closes.
pub async fn serve(registry: Arc<ServiceRegistry>) -> anyhow::Result<()> {
    let server = ContextdServer::new(registry);
    let transport = rmcp::transport::io::stdio();
    let service = rmcp::serve_server(server, transport).await?;
    service.waiting().await?;
    Ok(())
}
