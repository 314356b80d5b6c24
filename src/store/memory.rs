//! In-memory `Store`, used when no database path is configured.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::identity::ConversationId;
use crate::store::traits::{HistoryEntry, Store};

#[derive(Debug, Default)]
pub struct MemoryStore {
    history: RwLock<HashMap<ConversationId, Vec<HistoryEntry>>>,
    counters: RwLock<HashMap<String, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn append(
        &self,
        conversation: &ConversationId,
        entry: &HistoryEntry,
    ) -> Result<(), StoreError> {
        self.history
            .write()
            .await
            .entry(conversation.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn read(
        &self,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let history = self.history.read().await;
        let entries = history.get(conversation).map(Vec::as_slice).unwrap_or(&[]);
        let skip = entries.len().saturating_sub(limit);
        Ok(entries[skip..].to_vec())
    }

    async fn increment(&self, counter: &str, by: u64) -> Result<u64, StoreError> {
        let mut counters = self.counters.write().await;
        let value = counters.entry(counter.to_string()).or_default();
        *value = value.saturating_add(by);
        Ok(*value)
    }

    async fn counter(&self, counter: &str) -> Result<u64, StoreError> {
        Ok(self.counters.read().await.get(counter).copied().unwrap_or(0))
    }
}
