use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use relay_core::rotation::{
    IdentityProvider, RefreshedToken, SecretProperties, SecretStore, SecretVersion,
};
use relay_core::store::TokenRefreshRepository;
use relay_core::{
    IdentityError, JsonStore, LocalSecretStore, RotationConfig, RotationError, RotationManager,
    RotationOutcome, SecretStoreError, TokenRefreshInfo, TokenRegistry, TokenType,
};
use tokio::sync::Notify;

const SECRET: &str = "linkedin-access-token";

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

struct StubProvider {
    calls: AtomicUsize,
    expires_on: DateTime<Utc>,
}

impl StubProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            expires_on: now() + Duration::days(60),
        })
    }
}

#[async_trait]
impl IdentityProvider for StubProvider {
    async fn refresh_token(&self, _token: TokenType) -> Result<RefreshedToken, IdentityError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RefreshedToken {
            access_token: format!("fresh-{n}"),
            expires_on: self.expires_on,
        })
    }
}

/// Delegates to a local store but can be told to fail writes or serve a
/// stale read-back.
struct FlakySecrets {
    inner: LocalSecretStore,
    fail_writes: bool,
    stale_reads: bool,
}

#[async_trait]
impl SecretStore for FlakySecrets {
    async fn get_secret(&self, name: &str) -> Result<SecretVersion, SecretStoreError> {
        if self.stale_reads {
            let versions = self.inner.list_versions(name).await?;
            return versions
                .into_iter()
                .next()
                .ok_or_else(|| SecretStoreError::NotFound(name.into()));
        }
        self.inner.get_secret(name).await
    }

    async fn set_secret_value(&self, name: &str, value: &str) -> Result<SecretVersion, SecretStoreError> {
        if self.fail_writes {
            return Err(SecretStoreError::Unavailable("vault is down".into()));
        }
        self.inner.set_secret_value(name, value).await
    }

    async fn update_secret_properties(
        &self,
        name: &str,
        version: &str,
        properties: SecretProperties,
    ) -> Result<SecretVersion, SecretStoreError> {
        self.inner.update_secret_properties(name, version, properties).await
    }

    async fn list_versions(&self, name: &str) -> Result<Vec<SecretVersion>, SecretStoreError> {
        self.inner.list_versions(name).await
    }
}

struct Fixture {
    manager: RotationManager,
    secrets: LocalSecretStore,
    tokens: Arc<JsonStore>,
    provider: Arc<StubProvider>,
}

async fn fixture(expires_in: Option<Duration>, fail_writes: bool, stale_reads: bool) -> Fixture {
    let secrets = LocalSecretStore::in_memory();
    secrets.set_secret_value(SECRET, "original").await.unwrap();
    let tokens = Arc::new(JsonStore::in_memory());
    if let Some(expires_in) = expires_in {
        let mut info = TokenRefreshInfo::never(TokenType::LinkedIn);
        info.expires = now() + expires_in;
        info.last_checked = now() - Duration::days(50);
        info.last_refreshed = now() - Duration::days(55);
        tokens.save(info, None).await.unwrap();
    }
    let provider = StubProvider::new();
    let registry = TokenRegistry::new().register(TokenType::LinkedIn, SECRET, provider.clone());
    let store = Arc::new(FlakySecrets {
        inner: secrets.clone(),
        fail_writes,
        stale_reads,
    });
    let manager = RotationManager::new(registry, store, tokens.clone(), RotationConfig::default());
    Fixture {
        manager,
        secrets,
        tokens,
        provider,
    }
}

fn enabled(versions: &[SecretVersion]) -> Vec<&str> {
    versions.iter().filter(|v| v.enabled).map(|v| v.value.as_str()).collect()
}

#[tokio::test]
async fn expiring_in_three_days_rotates() {
    let fx = fixture(Some(Duration::days(3)), false, false).await;

    let outcome = fx.manager.check(TokenType::LinkedIn, now()).await.unwrap();
    let RotationOutcome::Rotated { expires, .. } = outcome else {
        panic!("expected rotation, got {outcome:?}");
    };
    assert_eq!(expires, now() + Duration::days(60));

    let versions = fx.secrets.list_versions(SECRET).await.unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(enabled(&versions), vec!["fresh-0"]);
    assert_eq!(versions[1].expires_on, Some(now() + Duration::days(60)));

    let info = fx.tokens.get(TokenType::LinkedIn).await.unwrap().unwrap();
    assert_eq!(info.expires, now() + Duration::days(60));
    assert_eq!(info.last_refreshed, now());
    assert_eq!(info.last_checked, now());
}

#[tokio::test]
async fn expiring_in_ten_days_is_left_alone() {
    let fx = fixture(Some(Duration::days(10)), false, false).await;
    let before = fx.tokens.get(TokenType::LinkedIn).await.unwrap();

    let outcome = fx.manager.check(TokenType::LinkedIn, now()).await.unwrap();
    assert_eq!(
        outcome,
        RotationOutcome::NotDue {
            expires: now() + Duration::days(10)
        }
    );
    assert_eq!(fx.provider.calls.load(Ordering::SeqCst), 0);
    assert_eq!(fx.tokens.get(TokenType::LinkedIn).await.unwrap(), before);
    assert_eq!(fx.secrets.list_versions(SECRET).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_secret_write_keeps_prior_version_and_state() {
    let fx = fixture(Some(Duration::days(1)), true, false).await;
    let before = serde_json::to_vec(&fx.tokens.get(TokenType::LinkedIn).await.unwrap()).unwrap();

    let err = fx.manager.check(TokenType::LinkedIn, now()).await.unwrap_err();
    assert!(matches!(err, RotationError::SecretStore(SecretStoreError::Unavailable(_))));

    let versions = fx.secrets.list_versions(SECRET).await.unwrap();
    assert_eq!(enabled(&versions), vec!["original"]);
    let after = serde_json::to_vec(&fx.tokens.get(TokenType::LinkedIn).await.unwrap()).unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn unconfirmed_write_is_rolled_back() {
    let fx = fixture(Some(Duration::days(1)), false, true).await;
    let before = fx.tokens.get(TokenType::LinkedIn).await.unwrap();

    let err = fx.manager.check(TokenType::LinkedIn, now()).await.unwrap_err();
    assert!(matches!(err, RotationError::NotConfirmed(_)));

    let versions = fx.secrets.list_versions(SECRET).await.unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(enabled(&versions), vec!["original"]);
    assert_eq!(fx.tokens.get(TokenType::LinkedIn).await.unwrap(), before);
}

#[tokio::test]
async fn first_check_creates_sentinel_state_and_rotates() {
    let fx = fixture(None, false, false).await;

    let outcome = fx.manager.check(TokenType::LinkedIn, now()).await.unwrap();
    assert!(matches!(outcome, RotationOutcome::Rotated { .. }));
    let info = fx.tokens.get(TokenType::LinkedIn).await.unwrap().unwrap();
    assert_eq!(info.version, 2);
    assert!(info.last_refreshed <= info.last_checked);
}

#[tokio::test]
async fn unregistered_tokens_are_reported() {
    let fx = fixture(None, false, false).await;
    let err = fx.manager.check(TokenType::Facebook, now()).await.unwrap_err();
    assert!(matches!(err, RotationError::Unregistered(TokenType::Facebook)));
}

struct GatedProvider {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl IdentityProvider for GatedProvider {
    async fn refresh_token(&self, _token: TokenType) -> Result<RefreshedToken, IdentityError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(RefreshedToken {
            access_token: "gated".into(),
            expires_on: now() + Duration::days(60),
        })
    }
}

#[tokio::test]
async fn second_check_while_rotating_is_skipped() {
    let secrets = LocalSecretStore::in_memory();
    secrets.set_secret_value(SECRET, "original").await.unwrap();
    let provider = Arc::new(GatedProvider {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let registry = TokenRegistry::new().register(TokenType::LinkedIn, SECRET, provider.clone());
    let manager = RotationManager::new(
        registry,
        Arc::new(secrets.clone()),
        Arc::new(JsonStore::in_memory()),
        RotationConfig::default(),
    );

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.check(TokenType::LinkedIn, now()).await })
    };
    provider.entered.notified().await;

    let second = manager.check(TokenType::LinkedIn, now()).await.unwrap();
    assert_eq!(second, RotationOutcome::InFlight);

    provider.release.notify_one();
    let first = first.await.unwrap().unwrap();
    assert!(matches!(first, RotationOutcome::Rotated { .. }));
    assert_eq!(enabled(&secrets.list_versions(SECRET).await.unwrap()), vec!["gated"]);
}

struct SlowProvider;

#[async_trait]
impl IdentityProvider for SlowProvider {
    async fn refresh_token(&self, _token: TokenType) -> Result<RefreshedToken, IdentityError> {
        tokio::time::sleep(StdDuration::from_secs(5)).await;
        Err(IdentityError::Refused("too late".into()))
    }
}

#[tokio::test]
async fn identity_timeout_aborts_without_writes() {
    let secrets = LocalSecretStore::in_memory();
    secrets.set_secret_value(SECRET, "original").await.unwrap();
    let registry = TokenRegistry::new().register(TokenType::LinkedIn, SECRET, Arc::new(SlowProvider));
    let manager = RotationManager::new(
        registry,
        Arc::new(secrets.clone()),
        Arc::new(JsonStore::in_memory()),
        RotationConfig {
            call_timeout: StdDuration::from_millis(50),
            ..RotationConfig::default()
        },
    );

    let err = manager.check(TokenType::LinkedIn, now()).await.unwrap_err();
    assert!(matches!(err, RotationError::Timeout { step: "identity refresh", .. }));
    assert_eq!(secrets.list_versions(SECRET).await.unwrap().len(), 1);
}

/// Applies every disable of a version other than `keep`, then reports a
/// timeout as if the response was lost.
struct LossyDisable {
    inner: LocalSecretStore,
    keep: String,
}

#[async_trait]
impl SecretStore for LossyDisable {
    async fn get_secret(&self, name: &str) -> Result<SecretVersion, SecretStoreError> {
        self.inner.get_secret(name).await
    }

    async fn set_secret_value(&self, name: &str, value: &str) -> Result<SecretVersion, SecretStoreError> {
        self.inner.set_secret_value(name, value).await
    }

    async fn update_secret_properties(
        &self,
        name: &str,
        version: &str,
        properties: SecretProperties,
    ) -> Result<SecretVersion, SecretStoreError> {
        let applied = self.inner.update_secret_properties(name, version, properties).await?;
        if properties.enabled == Some(false) && version == self.keep {
            return Err(SecretStoreError::Unavailable("response lost".into()));
        }
        Ok(applied)
    }

    async fn list_versions(&self, name: &str) -> Result<Vec<SecretVersion>, SecretStoreError> {
        self.inner.list_versions(name).await
    }
}

#[tokio::test]
async fn failed_disable_of_prior_version_keeps_the_confirmed_one() {
    let secrets = LocalSecretStore::in_memory();
    let original = secrets.set_secret_value(SECRET, "original").await.unwrap();
    let tokens = Arc::new(JsonStore::in_memory());
    let registry = TokenRegistry::new().register(TokenType::LinkedIn, SECRET, StubProvider::new());
    let store = Arc::new(LossyDisable {
        inner: secrets.clone(),
        keep: original.version.clone(),
    });
    let manager = RotationManager::new(registry, store, tokens.clone(), RotationConfig::default());

    let err = manager.check(TokenType::LinkedIn, now()).await.unwrap_err();
    assert!(matches!(err, RotationError::SecretStore(SecretStoreError::Unavailable(_))));

    // The disable went through remotely; the confirmed version must survive it.
    let versions = secrets.list_versions(SECRET).await.unwrap();
    assert_eq!(enabled(&versions), vec!["fresh-0"]);
    assert_eq!(secrets.get_secret(SECRET).await.unwrap().value, "fresh-0");

    // Nothing was recorded, so the next tick rotates again.
    let info = tokens.get(TokenType::LinkedIn).await.unwrap().unwrap();
    assert_eq!(info.last_refreshed, TokenRefreshInfo::never(TokenType::LinkedIn).last_refreshed);
    assert!(info.needs_rotation(now(), Duration::days(5)));
}
