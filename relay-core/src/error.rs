use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::queue::Platform;
use crate::rotation::TokenType;

/// Failure reported by a source reader.
///
/// `is_parse` separates malformed payloads from transport problems; neither
/// lets the caller advance the checkpoint.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("source timed out after {0:?}")]
    Timeout(Duration),
    #[error("source file unreadable: {0}")]
    Io(#[from] std::io::Error),
    #[error("rss parsing error: {0}")]
    Rss(#[from] rss::Error),
    #[error("atom parsing error: {0}")]
    Atom(#[from] atom_syndication::Error),
    #[error("json parsing error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed source response: {0}")]
    Malformed(String),
}

impl SourceError {
    pub fn is_parse(&self) -> bool {
        match self {
            SourceError::Rss(_)
            | SourceError::Atom(_)
            | SourceError::Json(_)
            | SourceError::Malformed(_) => true,
            SourceError::Network(err) => err.is_decode(),
            SourceError::Timeout(_) | SourceError::Io(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conditional write on {entity} `{key}` lost a race")]
    Conflict { entity: &'static str, key: String },
    #[error("{entity} `{key}` not found")]
    NotFound { entity: &'static str, key: String },
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("`{}` is unreadable and has no usable temp copy: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no queue configured for {0:?}")]
    NoRoute(Platform),
    #[error("queue `{0}` is closed")]
    Closed(&'static str),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("platform request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("platform rejected message: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("secret `{0}` not found")]
    NotFound(String),
    #[error("secret version `{0}` not found")]
    VersionNotFound(String),
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
    #[error("secret store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("secret store serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    File(StoreError),
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity provider request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("identity provider refused refresh: {0}")]
    Refused(String),
}

/// Any reason a rotation was abandoned. None of these are fatal; the next
/// tick starts over from the still-enabled previous version.
#[derive(Debug, Error)]
pub enum RotationError {
    #[error("no rotation policy registered for {0:?}")]
    Unregistered(TokenType),
    #[error("identity refresh failed: {0}")]
    Identity(#[from] IdentityError),
    #[error("secret store failed: {0}")]
    SecretStore(#[from] SecretStoreError),
    #[error("{step} timed out after {after:?}")]
    Timeout { step: &'static str, after: Duration },
    #[error("secret `{0}` did not read back as the new version")]
    NotConfirmed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("poller task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration directory on this platform")]
    NoConfigDir,
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
