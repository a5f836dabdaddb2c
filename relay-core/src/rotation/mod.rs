//! Credential rotation.
//!
//! A token is rotated when it has expired or will expire within the
//! lookahead window. The sequence is always: refresh with the identity
//! provider, write a new secret version, stamp its expiry, read it back,
//! disable the previous version, then record the new expiry. A failure
//! before the read-back confirms the new version leaves the previous version
//! as the enabled one and the stored [`TokenRefreshInfo`] untouched. Once
//! confirmed, the new version stays enabled even if disabling a previous
//! version fails; that rotation is still reported as failed and retried.

pub mod identity;
pub mod registry;
pub mod secrets;

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{RotationError, StoreError};
use crate::store::TokenRefreshRepository;
use crate::telemetry;

pub use identity::{IdentityProvider, OAuthRefreshProvider, RefreshedToken};
pub use registry::{RotationPolicy, TokenRegistry, TokenType};
pub use secrets::{LocalSecretStore, SecretProperties, SecretStore, SecretVersion};

/// Expiry bookkeeping for one token type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenRefreshInfo {
    pub name: TokenType,
    pub expires: DateTime<Utc>,
    pub last_checked: DateTime<Utc>,
    pub last_refreshed: DateTime<Utc>,
    pub last_updated_on: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Valid,
    ExpiringSoon,
    Expired,
}

impl TokenRefreshInfo {
    /// A token that has never been refreshed. The epoch expiry makes it due
    /// on the first check.
    pub fn never(name: TokenType) -> Self {
        Self {
            name,
            expires: DateTime::UNIX_EPOCH,
            last_checked: DateTime::UNIX_EPOCH,
            last_refreshed: DateTime::UNIX_EPOCH,
            last_updated_on: DateTime::UNIX_EPOCH,
            version: 0,
        }
    }

    pub fn state(&self, now: DateTime<Utc>, lookahead: Duration) -> TokenState {
        if self.expires < now {
            TokenState::Expired
        } else if self.expires - lookahead < now {
            TokenState::ExpiringSoon
        } else {
            TokenState::Valid
        }
    }

    pub fn needs_rotation(&self, now: DateTime<Utc>, lookahead: Duration) -> bool {
        self.state(now, lookahead) != TokenState::Valid
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotationConfig {
    pub lookahead: Duration,
    /// Bound on each identity or secret store call.
    pub call_timeout: StdDuration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            lookahead: Duration::days(5),
            call_timeout: StdDuration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RotationOutcome {
    NotDue { expires: DateTime<Utc> },
    Rotated { expires: DateTime<Utc>, secret_version: String },
    /// Another rotation of the same token is already running in this process.
    InFlight,
    /// The secret was rotated but another writer recorded its own rotation
    /// first.
    Superseded,
}

/// Rotates registered tokens against a secret store.
#[derive(Clone)]
pub struct RotationManager {
    registry: Arc<TokenRegistry>,
    secrets: Arc<dyn SecretStore>,
    tokens: Arc<dyn TokenRefreshRepository>,
    config: RotationConfig,
    in_flight: Arc<Mutex<HashSet<TokenType>>>,
}

struct InFlightLease {
    set: Arc<Mutex<HashSet<TokenType>>>,
    token: TokenType,
}

impl InFlightLease {
    fn acquire(set: &Arc<Mutex<HashSet<TokenType>>>, token: TokenType) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !guard.insert(token) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            token,
        })
    }
}

impl Drop for InFlightLease {
    fn drop(&mut self) {
        let mut guard = self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.remove(&self.token);
    }
}

async fn timed<T, E>(
    step: &'static str,
    after: StdDuration,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, RotationError>
where
    RotationError: From<E>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result.map_err(RotationError::from),
        Err(_) => Err(RotationError::Timeout { step, after }),
    }
}

impl RotationManager {
    pub fn new(
        registry: TokenRegistry,
        secrets: Arc<dyn SecretStore>,
        tokens: Arc<dyn TokenRefreshRepository>,
        config: RotationConfig,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            secrets,
            tokens,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn registry(&self) -> &TokenRegistry {
        &self.registry
    }

    /// Check every registered token, rotating the ones that are due.
    /// Failures are logged and counted; the next tick retries them.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<(TokenType, Result<RotationOutcome, RotationError>)> {
        let mut results = Vec::new();
        for token in self.registry.tokens() {
            let result = self.check(token, now).await;
            if let Err(err) = &result {
                warn!(token = %token, error = %err, "token rotation failed");
            }
            results.push((token, result));
        }
        results
    }

    /// Check one token and rotate it if it is expired or expiring soon.
    pub async fn check(&self, token: TokenType, now: DateTime<Utc>) -> Result<RotationOutcome, RotationError> {
        let Some(_lease) = InFlightLease::acquire(&self.in_flight, token) else {
            debug!(token = %token, "rotation already in flight");
            return Ok(RotationOutcome::InFlight);
        };
        let policy = self
            .registry
            .policy(token)
            .ok_or(RotationError::Unregistered(token))?;

        let info = self.load_or_create(token).await?;
        if !info.needs_rotation(now, self.config.lookahead) {
            debug!(token = %token, expires = %info.expires, "token still valid");
            return Ok(RotationOutcome::NotDue { expires: info.expires });
        }

        info!(token = %token, expires = %info.expires, "rotating token");
        let result = self.rotate(token, policy, info, now).await;
        telemetry::record_rotation(token, result.is_ok());
        result
    }

    async fn load_or_create(&self, token: TokenType) -> Result<TokenRefreshInfo, RotationError> {
        if let Some(info) = self.tokens.get(token).await? {
            return Ok(info);
        }
        match self.tokens.save(TokenRefreshInfo::never(token), None).await {
            Ok(info) => Ok(info),
            Err(err) if err.is_conflict() => self.tokens.get(token).await?.ok_or_else(|| {
                RotationError::Store(StoreError::NotFound {
                    entity: "token_refresh_info",
                    key: token.as_str().to_string(),
                })
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn rotate(
        &self,
        token: TokenType,
        policy: &RotationPolicy,
        info: TokenRefreshInfo,
        now: DateTime<Utc>,
    ) -> Result<RotationOutcome, RotationError> {
        let timeout = self.config.call_timeout;
        let name = policy.secret_name.as_str();

        let refreshed = timed("identity refresh", timeout, policy.provider.refresh_token(token)).await?;

        let prior: Vec<SecretVersion> = timed("secret listing", timeout, self.secrets.list_versions(name))
            .await?
            .into_iter()
            .filter(|v| v.enabled)
            .collect();

        let created = timed(
            "secret write",
            timeout,
            self.secrets.set_secret_value(name, &refreshed.access_token),
        )
        .await?;

        if let Err(err) = self.confirm(name, &created, &refreshed).await {
            self.abandon(name, &created).await;
            return Err(err);
        }
        // Confirmed: from here on the new version is never rolled back. A
        // failed disable leaves the info unchanged so the next tick retries.
        self.retire(name, &prior).await?;

        let rotated = TokenRefreshInfo {
            expires: refreshed.expires_on,
            last_checked: now,
            last_refreshed: now,
            last_updated_on: now,
            ..info
        };
        let expected = Some(rotated.version);
        match self.tokens.save(rotated, expected).await {
            Ok(saved) => {
                info!(token = %token, version = %created.version, expires = %saved.expires, "token rotated");
                Ok(RotationOutcome::Rotated {
                    expires: saved.expires,
                    secret_version: created.version,
                })
            }
            Err(err) if err.is_conflict() => {
                info!(token = %token, "token refresh info changed underneath; keeping the other writer's record");
                Ok(RotationOutcome::Superseded)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn confirm(
        &self,
        name: &str,
        created: &SecretVersion,
        refreshed: &RefreshedToken,
    ) -> Result<(), RotationError> {
        let timeout = self.config.call_timeout;
        timed(
            "secret expiry update",
            timeout,
            self.secrets.update_secret_properties(
                name,
                &created.version,
                SecretProperties::expires_on(refreshed.expires_on),
            ),
        )
        .await?;

        let current = timed("secret read-back", timeout, self.secrets.get_secret(name)).await?;
        if current.version != created.version || current.value != refreshed.access_token {
            return Err(RotationError::NotConfirmed(name.to_string()));
        }
        Ok(())
    }

    /// Disable the versions that were enabled before the rotation.
    async fn retire(&self, name: &str, prior: &[SecretVersion]) -> Result<(), RotationError> {
        for old in prior {
            timed(
                "secret disable",
                self.config.call_timeout,
                self.secrets
                    .update_secret_properties(name, &old.version, SecretProperties::disabled()),
            )
            .await?;
            debug!(secret = name, version = %old.version, "disabled prior secret version");
        }
        Ok(())
    }

    /// Best-effort rollback of a version that was written but not confirmed.
    async fn abandon(&self, name: &str, created: &SecretVersion) {
        let result = timed(
            "secret rollback",
            self.config.call_timeout,
            self.secrets
                .update_secret_properties(name, &created.version, SecretProperties::disabled()),
        )
        .await;
        if let Err(err) = result {
            warn!(secret = name, version = %created.version, error = %err, "failed to disable abandoned secret version");
        }
    }
}
