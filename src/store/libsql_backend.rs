//! libSQL backend for the `Store` trait. Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::identity::ConversationId;
use crate::store::migrations;
use crate::store::traits::{HistoryEntry, HistoryRole, Store};

/// libSQL store holding a single reused connection.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open libSQL database: {e}")))?;
        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database.
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }
}

/// Parse an RFC 3339 timestamp, falling back to the epoch minimum.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn row_to_entry(row: &libsql::Row) -> Result<HistoryEntry, libsql::Error> {
    let role_str: String = row.get(0)?;
    let created_str: String = row.get(3)?;
    let role = HistoryRole::parse(&role_str).unwrap_or_else(|| {
        warn!(role = %role_str, "Unknown history role, reading as contact");
        HistoryRole::Contact
    });
    Ok(HistoryEntry {
        role,
        content: row.get(1)?,
        kind: row.get(2)?,
        at: parse_datetime(&created_str),
    })
}

#[async_trait]
impl Store for LibSqlStore {
    async fn append(
        &self,
        conversation: &ConversationId,
        entry: &HistoryEntry,
    ) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO history (conversation_id, role, content, kind, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    conversation.as_str(),
                    entry.role.as_str(),
                    entry.content.as_str(),
                    entry.kind.as_str(),
                    entry.at.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("Failed to append history: {e}")))?;
        debug!(conversation = %conversation, role = %entry.role, "Appended history entry");
        Ok(())
    }

    async fn read(
        &self,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT role, content, kind, created_at FROM history
                 WHERE conversation_id = ?1
                 ORDER BY id DESC LIMIT ?2",
                params![conversation.as_str(), limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("Failed to read history: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("Failed to read history row: {e}")))?
        {
            let entry = row_to_entry(&row)
                .map_err(|e| StoreError::Serialization(format!("Bad history row: {e}")))?;
            entries.push(entry);
        }
        entries.reverse();
        Ok(entries)
    }

    async fn increment(&self, counter: &str, by: u64) -> Result<u64, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO counters (name, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET
                     value = value + excluded.value,
                     updated_at = excluded.updated_at",
                params![counter, by as i64, now],
            )
            .await
            .map_err(|e| StoreError::Query(format!("Failed to increment {counter}: {e}")))?;
        self.counter(counter).await
    }

    async fn counter(&self, counter: &str) -> Result<u64, StoreError> {
        let mut rows = self
            .conn
            .query("SELECT value FROM counters WHERE name = ?1", params![counter])
            .await
            .map_err(|e| StoreError::Query(format!("Failed to read {counter}: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("Failed to read {counter}: {e}")))?;
        match row {
            Some(row) => {
                let value: i64 = row
                    .get(0)
                    .map_err(|e| StoreError::Serialization(format!("Bad counter value: {e}")))?;
                Ok(value.max(0) as u64)
            }
            None => Ok(0),
        }
    }
}
