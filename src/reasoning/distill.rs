// src/reasoning/distill.rs
// Turns a recent session transcript into candidate memories via the AI
// client. Never persists anything itself; drafts go back to the caller.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ContextdError, Result};
use crate::llm::{AiClient, strip_code_fence};
use crate::reasoning::bank::MemoryDraft;
use crate::scrub::Scrubber;
use crate::transcript::RawMessage;

/// Default transcript window.
pub const DEFAULT_WINDOW: usize = 80;

/// Concurrent distillation calls against the AI client.
const AI_PERMITS: usize = 2;

/// Best-effort transcript distiller.
pub struct Distiller {
    ai: Option<Arc<dyn AiClient>>,
    scrubber: Arc<Scrubber>,
    permits: Semaphore,
}

impl Distiller {
    pub fn new(ai: Option<Arc<dyn AiClient>>, scrubber: Arc<Scrubber>) -> Self {
        Self {
            ai,
            scrubber,
            permits: Semaphore::new(AI_PERMITS),
        }
    }

    pub fn is_available(&self) -> bool {
        self.ai.is_some()
    }

    /// Distil a message window into memory drafts.
    ///
    /// Window: the last `DEFAULT_WINDOW` messages, or everything since
    /// `since` (the last recorded checkpoint), whichever is fewer. With no
    /// AI client configured this returns an empty list.
    pub async fn distill(
        &self,
        cancel: &CancellationToken,
        messages: &[RawMessage],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MemoryDraft>> {
        let Some(ai) = self.ai.as_ref() else {
            debug!("No AI client configured; skipping distillation");
            return Ok(Vec::new());
        };
        let window = select_window(messages, since);
        if window.is_empty() {
            return Ok(Vec::new());
        }

        let prompt = self.build_prompt(&window);

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ContextdError::Internal("distiller semaphore closed".into()))?;
        let response = ai.complete(&prompt, cancel).await?;
        Ok(parse_drafts(&response))
    }

    fn build_prompt(&self, window: &[&RawMessage]) -> String {
        let mut prompt = String::from(
            "You are distilling a coding session into durable memories.\n\
             Extract concrete, reusable learnings (decisions made, approaches \
             that worked or failed, project facts worth keeping).\n\n\
             Transcript:\n",
        );
        for message in window {
            let content = self.scrubber.scrub(&message.content).scrubbed;
            prompt.push_str(&format!(
                "[{} {}] {}\n",
                message.timestamp.format("%H:%M:%S"),
                message.role.as_str(),
                content
            ));
            if !message.tool_calls.is_empty() {
                prompt.push_str(&format!("  tools used: {}\n", message.tool_calls.join(", ")));
            }
        }
        prompt.push_str(
            "\nRespond with ONLY a JSON array, no prose. Each element:\n\
             {\"title\": \"...\", \"content\": \"...\", \"tags\": [\"...\"], \
             \"outcome\": \"success\"|\"failure\"|\"unknown\", \"confidence\": 0.0-1.0}\n\
             Return [] if the session contains nothing worth keeping.",
        );
        prompt
    }
}

/// Last K messages or everything after `since`, whichever set is smaller.
fn select_window<'a>(
    messages: &'a [RawMessage],
    since: Option<DateTime<Utc>>,
) -> Vec<&'a RawMessage> {
    let last_k: Vec<&RawMessage> = messages
        .iter()
        .skip(messages.len().saturating_sub(DEFAULT_WINDOW))
        .collect();
    match since {
        Some(since) => {
            let recent: Vec<&RawMessage> =
                messages.iter().filter(|m| m.timestamp > since).collect();
            if recent.len() < last_k.len() { recent } else { last_k }
        }
        None => last_k,
    }
}

/// Parse the AI response as a strict JSON array of drafts. Elements that
/// fail memory validation are dropped, not repaired.
fn parse_drafts(response: &str) -> Vec<MemoryDraft> {
    let cleaned = strip_code_fence(response);
    let parsed: Vec<MemoryDraft> = match serde_json::from_str(cleaned) {
        Ok(drafts) => drafts,
        Err(e) => {
            warn!("Distillation response was not valid JSON: {e}");
            return Vec::new();
        }
    };
    parsed
        .into_iter()
        .filter(|draft| match draft.validate() {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping invalid memory draft: {e}");
                false
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::StaticAiClient;
    use crate::transcript::Role;

    fn message(content: &str, minutes_ago: i64) -> RawMessage {
        RawMessage {
            session_id: "s1".to_string(),
            uuid: uuid::Uuid::new_v4().to_string(),
            parent_uuid: None,
            timestamp: Utc::now() - chrono::Duration::minutes(minutes_ago),
            role: Role::User,
            content: content.to_string(),
            tool_calls: Vec::new(),
            git_branch: None,
        }
    }

    #[tokio::test]
    async fn test_no_ai_client_returns_empty() {
        let distiller = Distiller::new(None, Arc::new(Scrubber::new()));
        let cancel = CancellationToken::new();
        let messages = vec![message("hello", 5)];
        let drafts = distiller.distill(&cancel, &messages, None).await.unwrap();
        assert!(drafts.is_empty());
    }

    #[tokio::test]
    async fn test_distill_parses_drafts() {
        let response = r#"[
            {"title": "use sqlx migrations", "content": "schema changes go through sqlx migrate", "tags": ["db"], "outcome": "success", "confidence": 0.8},
            {"title": "", "content": "invalid, dropped", "tags": [], "outcome": "unknown", "confidence": 0.5}
        ]"#;
        let ai = Arc::new(StaticAiClient::new(vec![response.to_string()]));
        let distiller = Distiller::new(Some(ai), Arc::new(Scrubber::new()));
        let cancel = CancellationToken::new();
        let messages = vec![message("we set up sqlx migrations", 5)];

        let drafts = distiller.distill(&cancel, &messages, None).await.unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].title, "use sqlx migrations");
        assert_eq!(drafts[0].confidence, Some(0.8));
    }

    #[tokio::test]
    async fn test_malformed_response_yields_empty() {
        let ai = Arc::new(StaticAiClient::new(vec!["not json".to_string()]));
        let distiller = Distiller::new(Some(ai), Arc::new(Scrubber::new()));
        let cancel = CancellationToken::new();
        let messages = vec![message("anything", 1)];
        let drafts = distiller.distill(&cancel, &messages, None).await.unwrap();
        assert!(drafts.is_empty());
    }

    #[test]
    fn test_window_selection_prefers_smaller_set() {
        let messages: Vec<RawMessage> = (0..100).map(|i| message("m", 100 - i)).collect();

        // No checkpoint: last 80.
        assert_eq!(select_window(&messages, None).len(), 80);

        // Recent checkpoint: only messages after it (fewer than 80).
        let since = Utc::now() - chrono::Duration::minutes(10);
        let window = select_window(&messages, Some(since));
        assert!(window.len() < 80);
        assert!(window.iter().all(|m| m.timestamp > since));

        // Ancient checkpoint: last 80 still wins.
        let since = Utc::now() - chrono::Duration::days(30);
        assert_eq!(select_window(&messages, Some(since)).len(), 80);
    }

    #[test]
    fn test_prompt_scrubs_secrets() {
        let distiller = Distiller::new(None, Arc::new(Scrubber::new()));
        let m = message("the key is sk-secret12345678", 1);
        let prompt = distiller.build_prompt(&[&m]);
        assert!(!prompt.contains("sk-secret12345678"));
        assert!(prompt.contains("[REDACTED]"));
    }
}
