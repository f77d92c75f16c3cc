// src/transcript.rs
// Parses JSONL session logs into the message stream consumed by distillation.
//
// JSONL format (one JSON object per line):
//   - user:      human prompt (string content) or tool_result (array content)
//   - assistant: thinking, text, or tool_use content blocks
//   - other entry types (progress, system, summary, ...) are skipped

use std::io::BufRead;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One transcript message. Ephemeral: input to distillation, never
/// persisted by the core.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub session_id: String,
    pub uuid: String,
    pub parent_uuid: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub content: String,
    pub tool_calls: Vec<String>,
    pub git_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLine {
    #[serde(rename = "type")]
    entry_type: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    uuid: Option<String>,
    #[serde(rename = "parentUuid")]
    parent_uuid: Option<String>,
    timestamp: Option<String>,
    #[serde(rename = "gitBranch")]
    git_branch: Option<String>,
    message: Option<RawInnerMessage>,
}

#[derive(Debug, Deserialize)]
struct RawInnerMessage {
    role: Option<String>,
    content: Option<serde_json::Value>,
}

/// Parse a session log file into messages, oldest first.
pub fn parse_session_file(path: &Path) -> std::io::Result<Vec<RawMessage>> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut messages = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line) {
            Some(message) => messages.push(message),
            None => debug!("Skipped transcript line {}", line_no + 1),
        }
    }
    Ok(messages)
}

/// Parse one JSONL line. Returns None for non-message entries and
/// malformed lines.
pub fn parse_line(line: &str) -> Option<RawMessage> {
    let raw: RawLine = serde_json::from_str(line).ok()?;
    let role = match raw.entry_type.as_deref() {
        Some("user") => Role::User,
        Some("assistant") => Role::Assistant,
        _ => return None,
    };
    let inner = raw.message?;
    // The inner role wins when present; some writers only set the outer type.
    let role = match inner.role.as_deref() {
        Some("user") => Role::User,
        Some("assistant") => Role::Assistant,
        Some(_) => return None,
        None => role,
    };

    let (content, tool_calls) = flatten_content(inner.content.as_ref()?);
    if content.is_empty() && tool_calls.is_empty() {
        return None;
    }

    let timestamp = raw
        .timestamp
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Some(RawMessage {
        session_id: raw.session_id.unwrap_or_default(),
        uuid: raw.uuid.unwrap_or_default(),
        parent_uuid: raw.parent_uuid,
        timestamp,
        role,
        content,
        tool_calls,
        git_branch: raw.git_branch,
    })
}

/// Flatten string-or-blocks content into text plus tool-call names.
fn flatten_content(content: &serde_json::Value) -> (String, Vec<String>) {
    match content {
        serde_json::Value::String(s) => (s.clone(), Vec::new()),
        serde_json::Value::Array(blocks) => {
            let mut text_parts = Vec::new();
            let mut tool_calls = Vec::new();
            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            text_parts.push(text.to_string());
                        }
                    }
                    Some("tool_use") => {
                        if let Some(name) = block.get("name").and_then(|n| n.as_str()) {
                            tool_calls.push(name.to_string());
                        }
                    }
                    Some("tool_result") => {
                        if let Some(text) = block.get("content").and_then(|c| c.as_str()) {
                            text_parts.push(text.to_string());
                        }
                    }
                    _ => {}
                }
            }
            (text_parts.join("\n"), tool_calls)
        }
        _ => (String::new(), Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_line() {
        let line = r#"{"type":"user","sessionId":"s1","uuid":"u1","timestamp":"2026-01-15T10:00:00Z","gitBranch":"main","message":{"role":"user","content":"fix the login bug"}}"#;
        let message = parse_line(line).unwrap();
        assert_eq!(message.role, Role::User);
        assert_eq!(message.content, "fix the login bug");
        assert_eq!(message.session_id, "s1");
        assert_eq!(message.git_branch.as_deref(), Some("main"));
    }

    #[test]
    fn test_parse_assistant_blocks_with_tool_use() {
        let line = r#"{"type":"assistant","uuid":"u2","parentUuid":"u1","timestamp":"2026-01-15T10:00:05Z","message":{"role":"assistant","content":[{"type":"text","text":"Looking at auth.rs"},{"type":"tool_use","name":"read_file","input":{}}]}}"#;
        let message = parse_line(line).unwrap();
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.content, "Looking at auth.rs");
        assert_eq!(message.tool_calls, vec!["read_file"]);
        assert_eq!(message.parent_uuid.as_deref(), Some("u1"));
    }

    #[test]
    fn test_non_message_entries_skipped() {
        assert!(parse_line(r#"{"type":"progress","data":{}}"#).is_none());
        assert!(parse_line(r#"{"type":"summary","summary":"..."}"#).is_none());
        assert!(parse_line("not json at all").is_none());
    }

    #[test]
    fn test_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"type":"user","sessionId":"s1","uuid":"u1","timestamp":"2026-01-15T10:00:00Z","message":{"role":"user","content":"hello"}}"#,
                "\n",
                r#"{"type":"progress","x":1}"#,
                "\n",
                r#"{"type":"assistant","uuid":"u2","timestamp":"2026-01-15T10:00:02Z","message":{"role":"assistant","content":[{"type":"text","text":"hi"}]}}"#,
                "\n",
            ),
        )
        .unwrap();
        let messages = parse_session_file(&path).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].content, "hi");
    }
}
