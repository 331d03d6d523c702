//! SQLite storage for folder cursors and leases.
//!
//! This module is split into:
//! - `mod.rs` - Store struct and connection pool
//! - `schema.rs` - Database schema initialization
//! - `folder_state.rs` - Per-folder generation/position cursor
//! - `lease.rs` - Compare-and-set folder ownership leases
//!
//! Both tables are only ever written with single conditional statements, so
//! several processes may share one database file.

mod folder_state;
mod lease;
mod schema;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub use folder_state::{FolderState, FolderStateStore};
pub use lease::{Acquire, LeaseCoordinator, LeaseKey, Renewal};

/// Connection pool size. Each listener touches the pool only briefly per
/// checkpoint or lease renewal.
const POOL_SIZE: u32 = 8;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(path: &Path) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", path.display());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Full);

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open state database {}", path.display()))?;

        schema::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to create in-memory connection pool")?;

        schema::init_schema(&pool).await?;

        Ok(Self { pool })
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
