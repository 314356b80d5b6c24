//! `Store` trait: conversation history and statistics counters.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::identity::ConversationId;

/// Statistics counter names written by the engine.
pub mod counters {
    pub const MESSAGES_PROCESSED: &str = "messages_processed";
    pub const REPLIES_SENT: &str = "replies_sent";
    pub const REPLIES_FAILED: &str = "replies_failed";
    pub const TOOLS_SENT: &str = "tools_sent";
    pub const GATE_REJECTIONS: &str = "gate_rejections";
}

/// Who produced a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRole {
    /// Inbound from the contact.
    Contact,
    /// Sent by the autopilot.
    Autopilot,
}

impl HistoryRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contact => "contact",
            Self::Autopilot => "autopilot",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "contact" => Some(Self::Contact),
            "autopilot" => Some(Self::Autopilot),
            _ => None,
        }
    }
}

impl fmt::Display for HistoryRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub content: String,
    /// Message kind label (`text`, `card`, `spotlight`, `tool`).
    pub kind: String,
    pub at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(role: HistoryRole, content: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            kind: kind.into(),
            at: Utc::now(),
        }
    }
}

/// Persistence for history and statistics.
#[async_trait]
pub trait Store: Send + Sync {
    /// Append an entry to a conversation's history.
    async fn append(
        &self,
        conversation: &ConversationId,
        entry: &HistoryEntry,
    ) -> Result<(), StoreError>;

    /// The most recent `limit` entries, oldest first.
    async fn read(
        &self,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError>;

    /// Add `by` to a named counter, returning the new value.
    async fn increment(&self, counter: &str, by: u64) -> Result<u64, StoreError>;

    /// Current value of a counter (0 if never written).
    async fn counter(&self, counter: &str) -> Result<u64, StoreError>;
}
