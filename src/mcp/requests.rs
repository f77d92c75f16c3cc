// src/mcp/requests.rs
// MCP tool request types

use rmcp::schemars;
use serde::Deserialize;

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CheckpointSaveRequest {
    #[schemars(description = "One-line summary of the session state")]
    pub summary: String,
    #[schemars(description = "Longer description of what was done")]
    pub description: String,
    #[schemars(description = "Absolute project root path")]
    pub project_path: String,
    #[schemars(description = "Full context blob to preserve")]
    pub context: Option<String>,
    #[schemars(description = "Tags for filtering (max 20)")]
    pub tags: Option<Vec<String>>,
    #[schemars(description = "Session ID")]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CheckpointSearchRequest {
    #[schemars(description = "Search query")]
    pub query: String,
    #[schemars(description = "Absolute project root path")]
    pub project_path: Option<String>,
    #[schemars(description = "Tags that must all be present")]
    pub tags: Option<Vec<String>>,
    #[schemars(description = "Max results (default 5)")]
    pub top_k: Option<usize>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CheckpointListRequest {
    #[schemars(description = "Absolute project root path")]
    pub project_path: Option<String>,
    #[schemars(description = "Max results (default 10)")]
    pub limit: Option<usize>,
    #[schemars(description = "Offset into the result list")]
    pub offset: Option<usize>,
    #[schemars(description = "Tags that must all be present")]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CheckpointResumeRequest {
    #[schemars(description = "Absolute project root path")]
    pub project_path: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct MemoryRecordRequest {
    #[schemars(description = "Short memory title")]
    pub title: String,
    #[schemars(description = "Memory content")]
    pub content: String,
    #[schemars(description = "Absolute project root path")]
    pub project_path: String,
    #[schemars(description = "Tags")]
    pub tags: Option<Vec<String>>,
    #[schemars(description = "Outcome label: success/failure/unknown")]
    pub outcome: Option<String>,
    #[schemars(description = "Initial confidence (0.0-1.0, default 0.5)")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct MemorySearchRequest {
    #[schemars(description = "Search query")]
    pub query: String,
    #[schemars(description = "Absolute project root path")]
    pub project_path: String,
    #[schemars(description = "Max results (default 5)")]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct MemoryFeedbackRequest {
    #[schemars(description = "Memory ID")]
    pub id: String,
    #[schemars(description = "Whether the memory was helpful")]
    pub helpful: bool,
    #[schemars(description = "Absolute project root path")]
    pub project_path: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct MemoryOutcomeRequest {
    #[schemars(description = "Memory ID")]
    pub id: String,
    #[schemars(description = "Whether applying the memory succeeded")]
    pub succeeded: bool,
    #[schemars(description = "Session ID the outcome was observed in")]
    pub session_id: String,
    #[schemars(description = "Absolute project root path")]
    pub project_path: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct TroubleshootRequest {
    #[schemars(description = "The error message to diagnose")]
    pub error_message: String,
    #[schemars(description = "Surrounding context (logs, recent changes)")]
    pub context: Option<String>,
    #[schemars(description = "Absolute project root path")]
    pub project_path: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ReflectAnalyzeRequest {
    #[schemars(description = "Absolute project root path")]
    pub project_path: String,
    #[schemars(description = "Minimum bucket confidence (default 0.3)")]
    pub min_confidence: Option<f64>,
    #[schemars(description = "Minimum bucket size (default 2)")]
    pub min_frequency: Option<usize>,
    #[schemars(description = "Max patterns returned (default 20)")]
    pub max_patterns: Option<usize>,
    #[schemars(description = "Only memories carrying one of these tags")]
    pub include_tags: Option<Vec<String>>,
    #[schemars(description = "Skip memories carrying one of these tags")]
    pub exclude_tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ReflectCorrelateRequest {
    #[schemars(description = "Absolute project root path")]
    pub project_path: String,
    #[schemars(description = "Correlation types: similar/co_occurs/opposite/sequential (default all)")]
    pub types: Option<Vec<String>>,
    #[schemars(description = "Minimum correlation strength (default 0.3)")]
    pub min_strength: Option<f64>,
    #[schemars(description = "Max correlations returned (default 50)")]
    pub max: Option<usize>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ReflectReportRequest {
    #[schemars(description = "Absolute project root path")]
    pub project_path: String,
    #[schemars(description = "Output format: json (canonical), text, markdown")]
    pub format: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct HookRegisterRequest {
    #[schemars(description = "Event kind: session_start/before_clear/after_clear/context_threshold/session_end")]
    pub kind: String,
    #[schemars(description = "Handler name")]
    pub name: String,
    #[schemars(description = "Keys merged into the event payload when the handler runs")]
    pub set: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct HookEmitRequest {
    #[schemars(description = "Event kind: session_start/before_clear/after_clear/context_threshold/session_end")]
    pub kind: String,
    #[schemars(description = "Absolute project root path")]
    pub project_path: String,
    #[schemars(description = "Initial event payload")]
    pub payload: Option<serde_json::Map<String, serde_json::Value>>,
}
