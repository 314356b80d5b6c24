//! Decision service: AI reply generation and lead-tool intent detection.
//!
//! The router calls this only when a rule asks for it (`use_ai`), when the
//! AI fallback is on, or for intent-driven tool sends. Every failure degrades
//! to "no action".

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LeadTool;
use crate::error::DecisionError;
use crate::store::HistoryEntry;

pub use http::{HttpDecisionConfig, HttpDecisionService};

/// Input for an intent decision.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentContext {
    pub conversation_id: String,
    pub content: String,
    pub history: Vec<HistoryEntry>,
    /// Tools the service may pick from.
    pub available_tools: Vec<LeadTool>,
}

/// Whether to send a lead tool, and which.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentDecision {
    pub should_send: bool,
    #[serde(default)]
    pub tool_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub confidence: f32,
}

/// AI collaborator used by the router.
#[async_trait]
pub trait DecisionService: Send + Sync {
    /// Service name for logging.
    fn name(&self) -> &str;

    /// Generate a reply to `content` given recent history (oldest first).
    async fn generate_reply(
        &self,
        content: &str,
        history: &[HistoryEntry],
    ) -> Result<String, DecisionError>;

    async fn get_intent(&self, context: &IntentContext) -> Result<IntentDecision, DecisionError>;
}

/// Used when no decision service is configured. Every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledDecisionService;

#[async_trait]
impl DecisionService for DisabledDecisionService {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn generate_reply(
        &self,
        _content: &str,
        _history: &[HistoryEntry],
    ) -> Result<String, DecisionError> {
        Err(DecisionError::Unavailable {
            service: self.name().to_string(),
        })
    }

    async fn get_intent(&self, _context: &IntentContext) -> Result<IntentDecision, DecisionError> {
        Err(DecisionError::Unavailable {
            service: self.name().to_string(),
        })
    }
}
