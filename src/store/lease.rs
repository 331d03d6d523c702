//! Compare-and-set leases guaranteeing one active listener per folder.
//!
//! Ownership moves only when the current lease has expired; nothing ever
//! takes a live lease by force.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::fmt;
use std::time::Duration;

use super::{Store, from_millis, now_millis};
use crate::error::SyncResult;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseKey {
    pub tenant: String,
    pub provider: String,
    pub folder: String,
}

impl LeaseKey {
    pub fn new(tenant: &str, provider: &str, folder: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            provider: provider.to_string(),
            folder: folder.to_string(),
        }
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.provider, self.folder)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_valid(&self) -> bool {
        self.expires_at > Utc::now()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    Granted(Lease),
    /// Someone else holds a valid lease.
    Denied(Lease),
}

impl Acquire {
    #[cfg(test)]
    pub fn is_granted(&self) -> bool {
        matches!(self, Acquire::Granted(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Renewal {
    Renewed(Lease),
    /// The lease expired or changed hands since the last renewal.
    Lost,
}

#[async_trait]
pub trait LeaseCoordinator: Send + Sync {
    async fn try_acquire(&self, key: &LeaseKey, owner: &str, ttl: Duration) -> SyncResult<Acquire>;
    async fn renew(&self, key: &LeaseKey, owner: &str, ttl: Duration) -> SyncResult<Renewal>;
    async fn release(&self, key: &LeaseKey, owner: &str) -> SyncResult<()>;
}

fn ttl_millis(ttl: Duration) -> i64 {
    ttl.as_millis().min(i64::MAX as u128) as i64
}

#[async_trait]
impl LeaseCoordinator for Store {
    async fn try_acquire(&self, key: &LeaseKey, owner: &str, ttl: Duration) -> SyncResult<Acquire> {
        let now = now_millis();
        let expires_at = now.saturating_add(ttl_millis(ttl));
        let lease_key = key.to_string();

        // The conflict branch only fires for an expired lease or our own, so
        // two racing acquirers can never both see a row change.
        let result = sqlx::query(
            r#"
            INSERT INTO leases (lease_key, owner, expires_at, acquired_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(lease_key) DO UPDATE SET
                owner = excluded.owner,
                expires_at = excluded.expires_at,
                acquired_at = excluded.acquired_at
            WHERE leases.expires_at <= ?4 OR leases.owner = excluded.owner
            "#,
        )
        .bind(&lease_key)
        .bind(owner)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(Acquire::Granted(Lease {
                owner: owner.to_string(),
                expires_at: from_millis(expires_at),
            }));
        }

        let holder = self.inspect_lease(key).await?.unwrap_or(Lease {
            owner: String::new(),
            expires_at: from_millis(now),
        });
        Ok(Acquire::Denied(holder))
    }

    async fn renew(&self, key: &LeaseKey, owner: &str, ttl: Duration) -> SyncResult<Renewal> {
        let now = now_millis();
        let expires_at = now.saturating_add(ttl_millis(ttl));

        let result = sqlx::query(
            "UPDATE leases SET expires_at = ? WHERE lease_key = ? AND owner = ? AND expires_at > ?",
        )
        .bind(expires_at)
        .bind(key.to_string())
        .bind(owner)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            Ok(Renewal::Renewed(Lease {
                owner: owner.to_string(),
                expires_at: from_millis(expires_at),
            }))
        } else {
            Ok(Renewal::Lost)
        }
    }

    async fn release(&self, key: &LeaseKey, owner: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM leases WHERE lease_key = ? AND owner = ?")
            .bind(key.to_string())
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl Store {
    /// Current lease row for a key, valid or not.
    pub async fn inspect_lease(&self, key: &LeaseKey) -> SyncResult<Option<Lease>> {
        let row = sqlx::query("SELECT owner, expires_at FROM leases WHERE lease_key = ?")
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| Lease {
            owner: row.get("owner"),
            expires_at: from_millis(row.get("expires_at")),
        }))
    }
}
