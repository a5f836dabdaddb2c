use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{SecretStoreError, StoreError};
use crate::storage::{read_json_with_tmp_fallback, write_json_atomic};

/// One version of a named secret.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecretVersion {
    pub name: String,
    pub version: String,
    pub value: String,
    pub enabled: bool,
    pub expires_on: Option<DateTime<Utc>>,
    pub created_on: DateTime<Utc>,
}

/// Mutable properties of a secret version.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SecretProperties {
    pub enabled: Option<bool>,
    pub expires_on: Option<DateTime<Utc>>,
}

impl SecretProperties {
    pub fn expires_on(expires_on: DateTime<Utc>) -> Self {
        Self {
            enabled: None,
            expires_on: Some(expires_on),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: Some(false),
            expires_on: None,
        }
    }
}

/// Versioned secret storage.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// The newest enabled version of `name`.
    async fn get_secret(&self, name: &str) -> Result<SecretVersion, SecretStoreError>;

    /// Store `value` as a new enabled version and return it.
    async fn set_secret_value(&self, name: &str, value: &str) -> Result<SecretVersion, SecretStoreError>;

    async fn update_secret_properties(
        &self,
        name: &str,
        version: &str,
        properties: SecretProperties,
    ) -> Result<SecretVersion, SecretStoreError>;

    /// Every version of `name`, oldest first.
    async fn list_versions(&self, name: &str) -> Result<Vec<SecretVersion>, SecretStoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SecretsFile {
    #[serde(default)]
    secrets: BTreeMap<String, Vec<SecretVersion>>,
}

/// Secret store kept in memory and optionally mirrored to a JSON file.
#[derive(Debug, Clone)]
pub struct LocalSecretStore {
    inner: Arc<RwLock<SecretsFile>>,
    path: Option<PathBuf>,
}

impl LocalSecretStore {
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(RwLock::new(SecretsFile::default())),
            path: None,
        }
    }

    pub async fn load_from(path: impl AsRef<Path>) -> Result<Self, SecretStoreError> {
        let path = path.as_ref().to_path_buf();
        let data: SecretsFile = read_json_with_tmp_fallback(&path)
            .await
            .map_err(file_error)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(data)),
            path: Some(path),
        })
    }

    async fn persist(&self, data: &SecretsFile) -> Result<(), SecretStoreError> {
        match &self.path {
            Some(path) => write_json_atomic(path, data).await.map_err(file_error),
            None => {
                debug!("secret store is in-memory only; skipping persist");
                Ok(())
            }
        }
    }
}

fn file_error(err: StoreError) -> SecretStoreError {
    match err {
        StoreError::Io(err) => SecretStoreError::Io(err),
        StoreError::Serialize(err) => SecretStoreError::Serialize(err),
        other => SecretStoreError::File(other),
    }
}

#[async_trait]
impl SecretStore for LocalSecretStore {
    async fn get_secret(&self, name: &str) -> Result<SecretVersion, SecretStoreError> {
        let inner = self.inner.read().await;
        inner
            .secrets
            .get(name)
            .and_then(|versions| versions.iter().rev().find(|v| v.enabled))
            .cloned()
            .ok_or_else(|| SecretStoreError::NotFound(name.to_string()))
    }

    async fn set_secret_value(&self, name: &str, value: &str) -> Result<SecretVersion, SecretStoreError> {
        let mut guard = self.inner.write().await;
        let mut next = guard.clone();
        let versions = next.secrets.entry(name.to_string()).or_default();
        let created = SecretVersion {
            name: name.to_string(),
            version: uuid::Uuid::new_v4().simple().to_string(),
            value: value.to_string(),
            enabled: true,
            expires_on: None,
            created_on: Utc::now(),
        };
        versions.push(created.clone());
        self.persist(&next).await?;
        *guard = next;
        Ok(created)
    }

    async fn update_secret_properties(
        &self,
        name: &str,
        version: &str,
        properties: SecretProperties,
    ) -> Result<SecretVersion, SecretStoreError> {
        let mut guard = self.inner.write().await;
        let mut next = guard.clone();
        let target = next
            .secrets
            .get_mut(name)
            .ok_or_else(|| SecretStoreError::NotFound(name.to_string()))?
            .iter_mut()
            .find(|v| v.version == version)
            .ok_or_else(|| SecretStoreError::VersionNotFound(version.to_string()))?;
        if let Some(enabled) = properties.enabled {
            target.enabled = enabled;
        }
        if let Some(expires_on) = properties.expires_on {
            target.expires_on = Some(expires_on);
        }
        let updated = target.clone();
        self.persist(&next).await?;
        *guard = next;
        Ok(updated)
    }

    async fn list_versions(&self, name: &str) -> Result<Vec<SecretVersion>, SecretStoreError> {
        let inner = self.inner.read().await;
        Ok(inner.secrets.get(name).cloned().unwrap_or_default())
    }
}
