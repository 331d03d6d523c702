//! Secret storage keyed by provider id and secret kind.
//!
//! Lookup order: environment variable, system keyring, then a `0600` file
//! under the config directory.

use std::env;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use crate::constants::KEYRING_SERVICE;
use crate::error::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretKind {
    Password,
    OAuthClientSecret,
    RefreshToken,
    /// Cached access token with its expiry, JSON encoded
    AccessToken,
}

impl SecretKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretKind::Password => "password",
            SecretKind::OAuthClientSecret => "oauth-client-secret",
            SecretKind::RefreshToken => "refresh-token",
            SecretKind::AccessToken => "access-token",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "password" => Some(SecretKind::Password),
            "oauth-client-secret" => Some(SecretKind::OAuthClientSecret),
            "refresh-token" => Some(SecretKind::RefreshToken),
            "access-token" => Some(SecretKind::AccessToken),
            _ => None,
        }
    }
}

impl fmt::Display for SecretKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait SecretStore: Send + Sync {
    fn get(&self, provider: &str, kind: SecretKind) -> Result<Option<String>, AuthError>;
    fn set(&self, provider: &str, kind: SecretKind, value: &str) -> Result<(), AuthError>;
}

/// Keyring-backed store with environment and file fallbacks
pub struct KeyringSecretStore {
    secrets_dir: PathBuf,
}

impl KeyringSecretStore {
    pub fn new() -> Self {
        let secrets_dir = crate::config::Config::config_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("secrets");
        Self { secrets_dir }
    }

    #[cfg(test)]
    fn with_dir(secrets_dir: PathBuf) -> Self {
        Self { secrets_dir }
    }

    /// `INBOXD_SECRET_<PROVIDER>_<KIND>` with non-alphanumerics folded to `_`
    pub fn env_var_name(provider: &str, kind: SecretKind) -> String {
        let fold = |s: &str| -> String {
            s.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_uppercase()
                    } else {
                        '_'
                    }
                })
                .collect()
        };
        format!("INBOXD_SECRET_{}_{}", fold(provider), fold(kind.as_str()))
    }

    fn keyring_key(provider: &str, kind: SecretKind) -> String {
        format!("{}:{}", kind, provider)
    }

    fn secret_file(&self, provider: &str, kind: SecretKind) -> PathBuf {
        let safe_provider = provider.replace(['@', '.', '/', '\\', ':'], "_");
        self.secrets_dir.join(format!(".{}_{}", kind, safe_provider))
    }

    /// Try to get secret from keyring
    fn keyring_get(&self, key: &str) -> Option<String> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, key).ok()?;
        entry.get_password().ok()
    }

    /// Try to set secret in keyring
    fn keyring_set(&self, key: &str, value: &str) -> bool {
        if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, key) {
            entry.set_password(value).is_ok()
        } else {
            false
        }
    }

    fn file_get(&self, provider: &str, kind: SecretKind) -> Option<String> {
        fs::read_to_string(self.secret_file(provider, kind))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Write secret to file fallback (with restricted permissions)
    fn file_set(&self, provider: &str, kind: SecretKind, value: &str) -> std::io::Result<()> {
        fs::create_dir_all(&self.secrets_dir)?;
        let path = self.secret_file(provider, kind);

        // Create file with restricted permissions atomically to avoid TOCTOU
        #[cfg(unix)]
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&path)?;
            file.write_all(value.as_bytes())?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&path, value)?;
        }

        Ok(())
    }
}

impl Default for KeyringSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for KeyringSecretStore {
    fn get(&self, provider: &str, kind: SecretKind) -> Result<Option<String>, AuthError> {
        // 1. Environment variable
        if let Ok(value) = env::var(Self::env_var_name(provider, kind)) {
            return Ok(Some(value));
        }

        // 2. Keyring
        if let Some(value) = self.keyring_get(&Self::keyring_key(provider, kind)) {
            return Ok(Some(value));
        }

        // 3. File fallback
        Ok(self.file_get(provider, kind))
    }

    fn set(&self, provider: &str, kind: SecretKind, value: &str) -> Result<(), AuthError> {
        let key = Self::keyring_key(provider, kind);
        if self.keyring_set(&key, value) && self.keyring_get(&key).as_deref() == Some(value) {
            // A stale file copy would shadow nothing, but keep the two in step.
            if self.secret_file(provider, kind).exists() {
                self.file_set(provider, kind, value)
                    .map_err(|e| AuthError::Storage(e.to_string()))?;
            }
            return Ok(());
        }

        tracing::debug!(provider, kind = %kind, "Keyring unavailable, using file-based storage");
        self.file_set(provider, kind, value)
            .map_err(|e| AuthError::Storage(format!("writing {} for '{}': {}", kind, provider, e)))
    }
}

/// In-process store for tests and embedding
#[cfg(test)]
#[derive(Default)]
pub struct MemorySecretStore {
    values: std::sync::Mutex<std::collections::HashMap<(String, SecretKind), String>>,
}

#[cfg(test)]
impl MemorySecretStore {
    pub fn with(entries: &[(&str, SecretKind, &str)]) -> Self {
        let store = Self::default();
        for (provider, kind, value) in entries {
            store.set(provider, *kind, value).unwrap();
        }
        store
    }
}

#[cfg(test)]
impl SecretStore for MemorySecretStore {
    fn get(&self, provider: &str, kind: SecretKind) -> Result<Option<String>, AuthError> {
        let values = self.values.lock().unwrap();
        Ok(values.get(&(provider.to_string(), kind)).cloned())
    }

    fn set(&self, provider: &str, kind: SecretKind, value: &str) -> Result<(), AuthError> {
        let mut values = self.values.lock().unwrap();
        values.insert((provider.to_string(), kind), value.to_string());
        Ok(())
    }
}
