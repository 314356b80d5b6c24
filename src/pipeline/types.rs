//! Shared types for the message processing pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::ConversationId;
use crate::surface::SenderRole;

// ── Message kind ────────────────────────────────────────────────────

/// What sort of message a node carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Plain text.
    Text,
    /// Structured card (title and/or body).
    Card,
    /// Promoted message carrying a source marker.
    Spotlight,
}

impl MessageKind {
    pub const ALL: [MessageKind; 3] = [Self::Text, Self::Card, Self::Spotlight];

    /// Short label for logging and fingerprints.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Card => "card",
            Self::Spotlight => "spotlight",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ── Classified message ──────────────────────────────────────────────

/// A classified, deduplicated inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Dedup key derived from the most stable features available.
    pub fingerprint: String,
    pub conversation_id: ConversationId,
    pub sender: SenderRole,
    /// Text the rules and decision service see (card title + body for cards).
    pub content: String,
    pub kind: MessageKind,
    /// Card title, if any.
    pub title: Option<String>,
    /// Spotlight source marker, if any.
    pub source_info: Option<String>,
    /// Time-of-day text as rendered by the surface.
    pub timestamp: Option<String>,
    /// Set once the message has been routed.
    pub processed: bool,
}

// ── Routing outcome ─────────────────────────────────────────────────

/// Where a text reply came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplySource {
    /// Static response configured on a rule.
    Rule { rule_id: String },
    /// Generated by the decision service for a rule with `use_ai`.
    RuleAi { rule_id: String },
    /// Generated by the decision service because no rule matched.
    Fallback,
}

/// A planned text reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPlan {
    pub text: String,
    pub source: ReplySource,
}

/// Where a lead-tool send came from.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolSource {
    /// Keyword-to-tool mapping on a rule.
    Rule { rule_id: String },
    /// Intent decision from the decision service.
    Intent {
        confidence: f32,
        reason: Option<String>,
    },
}

/// A planned lead-tool send.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPlan {
    pub tool_id: String,
    pub source: ToolSource,
}

/// Router output. Both branches are independent and may both fire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteDecision {
    pub reply: Option<ReplyPlan>,
    pub tool: Option<ToolPlan>,
}

impl RouteDecision {
    pub fn is_empty(&self) -> bool {
        self.reply.is_none() && self.tool.is_none()
    }
}
