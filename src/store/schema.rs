//! Database schema initialization.

use anyhow::Result;
use sqlx::SqlitePool;

/// Initialize database schema with all tables and indexes.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        -- Per-folder cursor: mailbox generation (UIDVALIDITY) and last processed UID
        CREATE TABLE IF NOT EXISTS folder_state (
            provider_id TEXT NOT NULL,
            folder TEXT NOT NULL,
            generation TEXT NOT NULL,
            last_position INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (provider_id, folder)
        );

        -- Time-bound folder ownership, one row per tenant/provider/folder key
        CREATE TABLE IF NOT EXISTS leases (
            lease_key TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            expires_at INTEGER NOT NULL,
            acquired_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_leases_owner ON leases(owner);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (1)")
        .execute(pool)
        .await?;

    Ok(())
}
