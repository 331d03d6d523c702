//! Durable per-folder cursor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use super::{Store, from_millis, now_millis};
use crate::error::SyncResult;

/// Where a listener resumes in a folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderState {
    /// Opaque mailbox epoch token (the folder's UIDVALIDITY)
    pub generation: String,
    /// Highest UID already processed in this generation
    pub last_position: u32,
    pub updated_at: DateTime<Utc>,
}

impl FolderState {
    pub fn new(generation: impl Into<String>, last_position: u32) -> Self {
        Self {
            generation: generation.into(),
            last_position,
            updated_at: Utc::now(),
        }
    }

    /// Whether this cursor can be resumed against a server reporting
    /// `generation` and `uid_next`.
    ///
    /// A different generation, or a position at or beyond the server's next
    /// UID (the cursor ran ahead of the mailbox), means the cursor is stale.
    pub fn resumable(&self, generation: &str, uid_next: Option<u32>) -> bool {
        if self.generation != generation {
            return false;
        }
        match uid_next {
            Some(next) => self.last_position < next,
            None => true,
        }
    }
}

#[async_trait]
pub trait FolderStateStore: Send + Sync {
    async fn load(&self, provider: &str, folder: &str) -> SyncResult<Option<FolderState>>;

    /// Persist `state`. Returns false when the write was refused because it
    /// would move the position backwards within the same generation.
    async fn save(&self, provider: &str, folder: &str, state: &FolderState) -> SyncResult<bool>;

    /// Forget the cursor so the next save starts a fresh epoch.
    async fn reset(&self, provider: &str, folder: &str) -> SyncResult<()>;
}

#[async_trait]
impl FolderStateStore for Store {
    async fn load(&self, provider: &str, folder: &str) -> SyncResult<Option<FolderState>> {
        let row = sqlx::query(
            "SELECT generation, last_position, updated_at FROM folder_state WHERE provider_id = ? AND folder = ?",
        )
        .bind(provider)
        .bind(folder)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| FolderState {
            generation: row.get("generation"),
            last_position: row.get::<i64, _>("last_position") as u32,
            updated_at: from_millis(row.get("updated_at")),
        }))
    }

    async fn save(&self, provider: &str, folder: &str, state: &FolderState) -> SyncResult<bool> {
        // One statement: generation and position land together or not at all.
        let result = sqlx::query(
            r#"
            INSERT INTO folder_state (provider_id, folder, generation, last_position, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(provider_id, folder) DO UPDATE SET
                generation = excluded.generation,
                last_position = excluded.last_position,
                updated_at = excluded.updated_at
            WHERE folder_state.generation != excluded.generation
               OR excluded.last_position >= folder_state.last_position
            "#,
        )
        .bind(provider)
        .bind(folder)
        .bind(&state.generation)
        .bind(state.last_position as i64)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() > 0;
        if !applied {
            tracing::warn!(
                provider,
                folder,
                generation = %state.generation,
                position = state.last_position,
                "Refused to move folder cursor backwards"
            );
        }
        Ok(applied)
    }

    async fn reset(&self, provider: &str, folder: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM folder_state WHERE provider_id = ? AND folder = ?")
            .bind(provider)
            .bind(folder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl Store {
    /// All cursors for a provider, ordered by folder.
    pub async fn list_folder_states(&self, provider: &str) -> SyncResult<Vec<(String, FolderState)>> {
        let rows = sqlx::query(
            "SELECT folder, generation, last_position, updated_at FROM folder_state WHERE provider_id = ? ORDER BY folder",
        )
        .bind(provider)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get("folder"),
                    FolderState {
                        generation: row.get("generation"),
                        last_position: row.get::<i64, _>("last_position") as u32,
                        updated_at: from_millis(row.get("updated_at")),
                    },
                )
            })
            .collect())
    }
}
