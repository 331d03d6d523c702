//! Credential resolution for provider connections.
//!
//! `CredentialResolver` turns a provider id into auth material the IMAP
//! session can use: a password for LOGIN, or a bearer token for XOAUTH2.
//! OAuth2 access tokens are cached (in memory and in secret storage) and
//! refreshed transparently when they get close to expiry.

mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::config::{AuthMethod, ProviderConnection};
use crate::constants::{DEFAULT_TOKEN_LIFETIME_SECS, TOKEN_EXPIRY_MARGIN_SECS};
use crate::error::AuthError;
use crate::oauth2::{RefreshRequest, TokenRefresher};

pub use store::{KeyringSecretStore, SecretKind, SecretStore};
#[cfg(test)]
pub use store::MemorySecretStore;

#[derive(Clone, PartialEq, Eq)]
pub enum Secret {
    Password(String),
    Bearer {
        access_token: String,
        expires_at: DateTime<Utc>,
    },
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::Password(_) => f.write_str("Password(<redacted>)"),
            Secret::Bearer { expires_at, .. } => f
                .debug_struct("Bearer")
                .field("access_token", &"<redacted>")
                .field("expires_at", expires_at)
                .finish(),
        }
    }
}

/// Resolved auth material for one provider
#[derive(Clone)]
pub struct Credential {
    pub provider: String,
    pub username: String,
    pub secret: Secret,
    /// Changes whenever the secret material changes
    pub version: u64,
}

impl Credential {
    /// Whether the material is usable for at least `margin` more time.
    pub fn is_fresh(&self, margin: chrono::Duration) -> bool {
        match &self.secret {
            Secret::Password(_) => true,
            Secret::Bearer { expires_at, .. } => *expires_at > Utc::now() + margin,
        }
    }

    pub fn is_oauth(&self) -> bool {
        matches!(self.secret, Secret::Bearer { .. })
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.secret {
            Secret::Password(_) => "password".to_string(),
            Secret::Bearer { expires_at, .. } => format!("bearer until {}", expires_at),
        };
        f.debug_struct("Credential")
            .field("provider", &self.provider)
            .field("username", &self.username)
            .field("secret", &kind)
            .field("version", &self.version)
            .finish()
    }
}

/// Access token as persisted under `SecretKind::AccessToken`
#[derive(Serialize, Deserialize)]
struct StoredAccessToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Clone)]
struct ProviderAuth {
    username: String,
    method: AuthMethod,
}

pub struct CredentialResolver {
    providers: RwLock<HashMap<String, ProviderAuth>>,
    secrets: Arc<dyn SecretStore>,
    refresher: Arc<dyn TokenRefresher>,
    /// Hot credentials; `try_get_with` makes concurrent loads single-flight.
    cache: moka::future::Cache<String, Credential>,
    margin: chrono::Duration,
    next_version: AtomicU64,
}

impl CredentialResolver {
    pub fn new(secrets: Arc<dyn SecretStore>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            secrets,
            refresher,
            cache: moka::future::Cache::builder().max_capacity(10_000).build(),
            margin: chrono::Duration::seconds(TOKEN_EXPIRY_MARGIN_SECS),
            next_version: AtomicU64::new(1),
        }
    }

    #[cfg(test)]
    pub fn with_margin(mut self, margin: chrono::Duration) -> Self {
        self.margin = margin;
        self
    }

    /// Make a provider known to the resolver, replacing earlier settings.
    pub fn register(&self, provider: &ProviderConnection) {
        let auth = ProviderAuth {
            username: provider.username.clone(),
            method: provider.auth.clone(),
        };
        if let Ok(mut providers) = self.providers.write() {
            providers.insert(provider.id.clone(), auth);
        }
    }

    /// Drop cached material, e.g. after a credential rotation.
    pub async fn invalidate(&self, provider: &str) {
        self.cache.invalidate(provider).await;
    }

    /// Current credential, refreshing an OAuth2 token that is about to expire.
    pub async fn resolve(&self, provider: &str) -> Result<Credential, AuthError> {
        if let Some(cached) = self.cache.get(provider).await {
            if cached.is_fresh(self.margin) {
                return Ok(cached);
            }
            tracing::debug!(provider, version = cached.version, "Cached credential is stale");
            self.cache.invalidate(provider).await;
        }
        self.load(provider, false).await
    }

    /// Force new material after the server rejected credential `rejected`:
    /// exchange the refresh token, or re-read the password.
    ///
    /// When another caller already replaced the rejected version, its newer
    /// credential is returned without a second exchange.
    pub async fn refresh(&self, provider: &str, rejected: u64) -> Result<Credential, AuthError> {
        if let Some(cached) = self.cache.get(provider).await
            && cached.version > rejected
        {
            tracing::debug!(provider, version = cached.version, "Credential already refreshed");
            return Ok(cached);
        }
        self.cache.invalidate(provider).await;
        self.load(provider, true).await
    }

    async fn load(&self, provider: &str, force: bool) -> Result<Credential, AuthError> {
        self.cache
            .try_get_with(provider.to_string(), self.mint(provider, force))
            .await
            .map_err(|e| (*e).clone())
    }

    async fn mint(&self, provider: &str, force: bool) -> Result<Credential, AuthError> {
        let auth = self
            .providers
            .read()
            .ok()
            .and_then(|providers| providers.get(provider).cloned())
            .ok_or_else(|| AuthError::Missing {
                provider: provider.to_string(),
                kind: "provider registration".to_string(),
            })?;

        let secret = match &auth.method {
            AuthMethod::Password => {
                let password = self.require(provider, SecretKind::Password)?;
                Secret::Password(password)
            }
            AuthMethod::OAuth2 {
                token_url,
                client_id,
                scopes,
            } => {
                if !force && let Some(stored) = self.stored_access_token(provider) {
                    stored
                } else {
                    self.exchange(provider, token_url, client_id, scopes.as_deref())
                        .await?
                }
            }
        };

        Ok(Credential {
            provider: provider.to_string(),
            username: auth.username,
            secret,
            version: self.next_version.fetch_add(1, Ordering::SeqCst),
        })
    }

    /// Stored access token, if it is still comfortably valid.
    fn stored_access_token(&self, provider: &str) -> Option<Secret> {
        let raw = self.secrets.get(provider, SecretKind::AccessToken).ok()??;
        let stored: StoredAccessToken = serde_json::from_str(&raw).ok()?;
        if stored.expires_at > Utc::now() + self.margin {
            Some(Secret::Bearer {
                access_token: stored.access_token,
                expires_at: stored.expires_at,
            })
        } else {
            None
        }
    }

    async fn exchange(
        &self,
        provider: &str,
        token_url: &str,
        client_id: &str,
        scopes: Option<&str>,
    ) -> Result<Secret, AuthError> {
        let refresh_token = self.require(provider, SecretKind::RefreshToken)?;
        let client_secret = self.secrets.get(provider, SecretKind::OAuthClientSecret)?;

        tracing::info!(provider, "Refreshing OAuth2 access token");
        let tokens = self
            .refresher
            .refresh(RefreshRequest {
                token_url,
                client_id,
                client_secret: client_secret.as_deref(),
                refresh_token: &refresh_token,
                scopes,
            })
            .await
            .inspect_err(|e| tracing::warn!(provider, error = %e, "OAuth2 refresh failed"))?;

        let lifetime = tokens
            .expires_in
            .map(|secs| secs as i64)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        let expires_at = Utc::now() + chrono::Duration::seconds(lifetime);

        // Write-back failures only cost a refresh on the next start.
        if let Some(rotated) = tokens.refresh_token.as_deref()
            && rotated != refresh_token
            && let Err(e) = self.secrets.set(provider, SecretKind::RefreshToken, rotated)
        {
            tracing::warn!(provider, error = %e, "Failed to store rotated refresh token");
        }
        let stored = StoredAccessToken {
            access_token: tokens.access_token.clone(),
            expires_at,
        };
        match serde_json::to_string(&stored) {
            Ok(json) => {
                if let Err(e) = self.secrets.set(provider, SecretKind::AccessToken, &json) {
                    tracing::warn!(provider, error = %e, "Failed to store access token");
                }
            }
            Err(e) => tracing::warn!(provider, error = %e, "Failed to encode access token"),
        }

        Ok(Secret::Bearer {
            access_token: tokens.access_token,
            expires_at,
        })
    }

    fn require(&self, provider: &str, kind: SecretKind) -> Result<String, AuthError> {
        self.secrets
            .get(provider, kind)?
            .ok_or_else(|| AuthError::Missing {
                provider: provider.to_string(),
                kind: kind.to_string(),
            })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{ScriptedRefresher, token};
    use super::*;
    use crate::config::{ImapConfig, TuningOverrides};

    fn provider(id: &str, auth: AuthMethod) -> ProviderConnection {
        ProviderConnection {
            id: id.to_string(),
            tenant: "acme".to_string(),
            enabled: true,
            imap: ImapConfig {
                server: "imap.example.com".to_string(),
                port: 993,
                tls: crate::config::TlsMode::Tls,
            },
            username: format!("{}@example.com", id),
            auth,
            folders: Vec::new(),
            tuning: TuningOverrides::default(),
        }
    }

    fn oauth() -> AuthMethod {
        AuthMethod::OAuth2 {
            token_url: "https://login.example/token".to_string(),
            client_id: "client".to_string(),
            scopes: None,
        }
    }

    #[tokio::test]
    async fn test_password_resolution() {
        let secrets = Arc::new(MemorySecretStore::with(&[("mail", SecretKind::Password, "hunter2")]));
        let resolver = CredentialResolver::new(secrets, Arc::new(ScriptedRefresher::default()));
        resolver.register(&provider("mail", AuthMethod::Password));

        let credential = resolver.resolve("mail").await.unwrap();
        assert_eq!(credential.secret, Secret::Password("hunter2".to_string()));
        assert_eq!(credential.username, "mail@example.com");

        // Cached: same version on the second call.
        assert_eq!(resolver.resolve("mail").await.unwrap().version, credential.version);
    }

    #[tokio::test]
    async fn test_missing_secret_is_terminal() {
        let resolver = CredentialResolver::new(
            Arc::new(MemorySecretStore::default()),
            Arc::new(ScriptedRefresher::default()),
        );
        resolver.register(&provider("mail", AuthMethod::Password));
        let err = resolver.resolve("mail").await.unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_oauth_token_cached_until_margin() {
        let secrets = Arc::new(MemorySecretStore::with(&[("g", SecretKind::RefreshToken, "rt")]));
        let refresher = Arc::new(ScriptedRefresher::default());
        let resolver = CredentialResolver::new(secrets.clone(), refresher.clone());
        resolver.register(&provider("g", oauth()));

        let first = resolver.resolve("g").await.unwrap();
        let second = resolver.resolve("g").await.unwrap();
        assert_eq!(refresher.calls(), 1);
        assert_eq!(first.version, second.version);
        assert!(first.is_oauth());

        // The new token was written back for the next process start.
        assert!(secrets.get("g", SecretKind::AccessToken).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_token_refreshes_once() {
        let secrets = Arc::new(MemorySecretStore::with(&[("g", SecretKind::RefreshToken, "rt")]));
        // First token is already inside the expiry margin.
        let refresher = Arc::new(ScriptedRefresher::new(vec![Ok(token("short", 30))]));
        let resolver = CredentialResolver::new(secrets, refresher.clone());
        resolver.register(&provider("g", oauth()));

        let stale = resolver.resolve("g").await.unwrap();
        assert_eq!(refresher.calls(), 1);
        let fresh = resolver.resolve("g").await.unwrap();
        assert_eq!(refresher.calls(), 2);
        assert_ne!(stale.version, fresh.version);
        assert!(fresh.is_fresh(chrono::Duration::seconds(TOKEN_EXPIRY_MARGIN_SECS)));
    }

    #[tokio::test]
    async fn test_revoked_refresh_token() {
        let secrets = Arc::new(MemorySecretStore::with(&[("g", SecretKind::RefreshToken, "rt")]));
        let refresher = Arc::new(ScriptedRefresher::new(vec![Err(AuthError::Revoked(
            "invalid_grant".into(),
        ))]));
        let resolver = CredentialResolver::new(secrets, refresher.clone());
        resolver.register(&provider("g", oauth()));

        let err = resolver.resolve("g").await.unwrap_err();
        assert!(matches!(err, AuthError::Revoked(_)));
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_rotated_refresh_token_is_stored() {
        let secrets = Arc::new(MemorySecretStore::with(&[("g", SecretKind::RefreshToken, "old")]));
        let mut rotated = token("a", 3600);
        rotated.refresh_token = Some("new".to_string());
        let resolver =
            CredentialResolver::new(secrets.clone(), Arc::new(ScriptedRefresher::new(vec![Ok(rotated)])));
        resolver.register(&provider("g", oauth()));

        resolver.resolve("g").await.unwrap();
        assert_eq!(
            secrets.get("g", SecretKind::RefreshToken).unwrap().as_deref(),
            Some("new")
        );
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_refresh() {
        let secrets = Arc::new(MemorySecretStore::with(&[("g", SecretKind::RefreshToken, "rt")]));
        let refresher = Arc::new(ScriptedRefresher::default());
        let resolver = Arc::new(CredentialResolver::new(secrets, refresher.clone()));
        resolver.register(&provider("g", oauth()));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let resolver = Arc::clone(&resolver);
            tasks.push(tokio::spawn(async move { resolver.resolve("g").await.unwrap().version }));
        }
        let mut versions = Vec::new();
        for task in tasks {
            versions.push(task.await.unwrap());
        }
        versions.dedup();
        assert_eq!(versions.len(), 1);
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn test_forced_refresh_rereads_password() {
        let secrets = Arc::new(MemorySecretStore::with(&[("mail", SecretKind::Password, "old")]));
        let resolver =
            CredentialResolver::new(secrets.clone(), Arc::new(ScriptedRefresher::default()));
        resolver.register(&provider("mail", AuthMethod::Password));

        let before = resolver.resolve("mail").await.unwrap();
        secrets.set("mail", SecretKind::Password, "rotated").unwrap();
        let after = resolver.refresh("mail", before.version).await.unwrap();
        assert_eq!(after.secret, Secret::Password("rotated".to_string()));
        assert!(after.version > before.version);
    }

    #[tokio::test]
    async fn test_sibling_rejections_share_one_refresh() {
        let secrets = Arc::new(MemorySecretStore::with(&[("g", SecretKind::RefreshToken, "rt")]));
        let refresher = Arc::new(ScriptedRefresher::default());
        let resolver = CredentialResolver::new(secrets, refresher.clone());
        resolver.register(&provider("g", oauth()));

        let rejected = resolver.resolve("g").await.unwrap();
        assert_eq!(refresher.calls(), 1);

        // Several folders report the same rejected token.
        let first = resolver.refresh("g", rejected.version).await.unwrap();
        let second = resolver.refresh("g", rejected.version).await.unwrap();
        let third = resolver.refresh("g", rejected.version).await.unwrap();
        assert_eq!(refresher.calls(), 2);
        assert_eq!(first.version, second.version);
        assert_eq!(second.version, third.version);

        // A rejection of the fresh token does exchange again.
        resolver.refresh("g", third.version).await.unwrap();
        assert_eq!(refresher.calls(), 3);
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let password = format!("{:?}", Secret::Password("hunter2".into()));
        assert!(!password.contains("hunter2"));
        let bearer = format!(
            "{:?}",
            Secret::Bearer {
                access_token: "ya29.secret".into(),
                expires_at: Utc::now(),
            }
        );
        assert!(!bearer.contains("ya29"));
    }
}
