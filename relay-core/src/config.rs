use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::dispatch::DispatchConfig;
use crate::error::ConfigError;
use crate::ingest::RandomPostPlan;
use crate::queue::Platform;
use crate::random::RandomQuery;
use crate::rotation::{RotationConfig, TokenType};
use crate::schedule::{Immediate, RetryPolicy, SchedulePolicy, Staggered};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub poll: PollSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub rotation: RotationSettings,
    #[serde(default)]
    pub random_post: RandomPostSettings,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub publishers: Vec<PublisherConfig>,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
    /// Address for the Prometheus scrape endpoint, e.g. `127.0.0.1:9898`.
    #[serde(default)]
    pub metrics_listen: Option<String>,
    /// Where the record store and local secrets live. Defaults to the
    /// config directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub interval_minutes: u64,
    pub dispatch_interval_seconds: u64,
    pub request_timeout_seconds: u64,
    pub retry_attempts: u8,
    pub retry_backoff_ms: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_minutes: 15,
            dispatch_interval_seconds: 60,
            request_timeout_seconds: 10,
            retry_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub claim_ttl_seconds: i64,
    pub enqueue_timeout_seconds: u64,
    pub max_attempts: u32,
    pub base_backoff_seconds: i64,
    pub max_backoff_minutes: i64,
    pub stuck_after_hours: i64,
    pub queue_capacity: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            claim_ttl_seconds: 300,
            enqueue_timeout_seconds: 10,
            max_attempts: 8,
            base_backoff_seconds: 60,
            max_backoff_minutes: 360,
            stuck_after_hours: 24,
            queue_capacity: 256,
        }
    }
}

impl DispatchSettings {
    pub fn to_dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            claim_ttl: Duration::seconds(self.claim_ttl_seconds),
            enqueue_timeout: StdDuration::from_secs(self.enqueue_timeout_seconds),
            retry: RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                base_backoff: Duration::seconds(self.base_backoff_seconds),
                max_backoff: Duration::minutes(self.max_backoff_minutes),
            },
            stuck_after: Duration::hours(self.stuck_after_hours),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationSettings {
    pub interval_minutes: u64,
    pub lookahead_days: i64,
    pub call_timeout_seconds: u64,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            interval_minutes: 360,
            lookahead_days: 5,
            call_timeout_seconds: 30,
        }
    }
}

impl RotationSettings {
    pub fn to_rotation_config(&self) -> RotationConfig {
        RotationConfig {
            lookahead: Duration::days(self.lookahead_days),
            call_timeout: StdDuration::from_secs(self.call_timeout_seconds),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomPostSettings {
    pub enabled: bool,
    pub interval_minutes: u64,
    /// Only items published within this many days are resurfaced.
    pub cutoff_days: i64,
    pub excluded_tags: Vec<String>,
    pub delay_minutes: i64,
    pub platforms: Vec<Platform>,
}

impl Default for RandomPostSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 480,
            cutoff_days: 365 * 2,
            excluded_tags: Vec::new(),
            delay_minutes: 5,
            platforms: Platform::ALL.to_vec(),
        }
    }
}

impl RandomPostSettings {
    pub fn to_plan(&self, now: chrono::DateTime<chrono::Utc>) -> RandomPostPlan {
        RandomPostPlan {
            query: RandomQuery {
                cutoff: now - Duration::days(self.cutoff_days),
                excluded_tags: self.excluded_tags.clone(),
            },
            delay: Duration::minutes(self.delay_minutes),
            platforms: self.platforms.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    /// Checkpoint key; must be unique.
    pub name: String,
    #[serde(flatten)]
    pub kind: SourceKind,
    #[serde(default)]
    pub schedule: SchedulePolicyConfig,
    #[serde(default = "all_platforms")]
    pub platforms: Vec<Platform>,
}

fn all_platforms() -> Vec<Platform> {
    Platform::ALL.to_vec()
}

fn default_page_size() -> u32 {
    25
}

fn default_max_pages() -> u32 {
    20
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKind {
    SyndicationFeed {
        url: String,
    },
    JsonFeed {
        url: String,
    },
    Video {
        api_url: String,
        channel_id: String,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default = "default_page_size")]
        page_size: u32,
        #[serde(default = "default_max_pages")]
        max_pages: u32,
        #[serde(default = "default_true")]
        assume_sorted: bool,
    },
    Engagements {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SchedulePolicyConfig {
    #[default]
    Immediate,
    Staggered {
        delay_minutes: i64,
        spacing_minutes: i64,
    },
}

impl SchedulePolicyConfig {
    pub fn build(&self) -> Arc<dyn SchedulePolicy> {
        match self {
            SchedulePolicyConfig::Immediate => Arc::new(Immediate),
            SchedulePolicyConfig::Staggered {
                delay_minutes,
                spacing_minutes,
            } => Arc::new(Staggered {
                delay: Duration::minutes(*delay_minutes),
                spacing: Duration::minutes(*spacing_minutes),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublisherConfig {
    pub platform: Platform,
    pub webhook_url: String,
    #[serde(default = "default_publish_timeout")]
    pub timeout_seconds: u64,
}

fn default_publish_timeout() -> u64 {
    15
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenConfig {
    pub token: TokenType,
    pub secret_name: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("token", &self.token)
            .field("secret_name", &self.secret_name)
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

fn check_url(what: &str, raw: &str) -> Result<(), ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::Invalid(format!("{what}: `{raw}` is not a url: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::Invalid(format!(
            "{what}: unsupported scheme `{other}`"
        ))),
    }
}

impl AppConfig {
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join("relay"))
    }

    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Directory for the record store and local secrets.
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Self::config_dir(),
        }
    }

    /// Load the configuration from the default location, writing the
    /// defaults there on first run.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_or_init(&Self::config_file_path()?)
    }

    /// Load `path`, or create it with the defaults when it does not exist.
    /// A file that exists but fails to parse or validate is reported and
    /// left untouched.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        match Self::load_from(path) {
            Err(ConfigError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "no configuration found; writing defaults");
                let default_config = Self::default();
                if let Err(save_err) = default_config.save_to(path) {
                    warn!(error = %save_err, "could not save default configuration");
                }
                Ok(default_config)
            }
            other => other,
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_file_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(ConfigError::Invalid("source with an empty name".into()));
            }
            if !names.insert(source.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate source name `{}`",
                    source.name
                )));
            }
            match &source.kind {
                SourceKind::SyndicationFeed { url } | SourceKind::JsonFeed { url } => {
                    check_url(&source.name, url)?
                }
                SourceKind::Video { api_url, .. } => check_url(&source.name, api_url)?,
                SourceKind::Engagements { .. } => {}
            }
        }

        let mut platforms = HashSet::new();
        for publisher in &self.publishers {
            if !platforms.insert(publisher.platform) {
                return Err(ConfigError::Invalid(format!(
                    "more than one publisher for {:?}",
                    publisher.platform
                )));
            }
            check_url(publisher.platform.queue_name(), &publisher.webhook_url)?;
        }

        let mut tokens = HashSet::new();
        for token in &self.tokens {
            if !tokens.insert(token.token) {
                return Err(ConfigError::Invalid(format!(
                    "token {} configured twice",
                    token.token
                )));
            }
            check_url(token.token.as_str(), &token.token_url)?;
        }
        Ok(())
    }
}
