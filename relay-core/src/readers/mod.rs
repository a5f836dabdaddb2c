pub mod engagements;
pub mod json_feed;
pub mod syndication;
pub mod video;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::{SourceConfig, SourceKind};
use crate::error::SourceError;
use crate::poller::PollConfig;
use crate::source::{SourceData, SourceSystem};

pub use engagements::EngagementsReader;
pub use json_feed::JsonFeedReader;
pub use syndication::SyndicationReader;
pub use video::VideoReader;

/// One pollable content source.
///
/// Implementations only read. They return items whose publication or update
/// date is strictly after `since`, and report failures instead of returning
/// partial results.
#[async_trait]
pub trait SourceReader: Send + Sync {
    fn system(&self) -> SourceSystem;

    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<SourceData>, SourceError>;
}

/// Build the reader for a configured source.
pub fn build_reader(config: &SourceConfig, client: Client) -> Arc<dyn SourceReader> {
    match &config.kind {
        SourceKind::SyndicationFeed { url } => Arc::new(SyndicationReader::new(client, url.clone())),
        SourceKind::JsonFeed { url } => Arc::new(JsonFeedReader::new(client, url.clone())),
        SourceKind::Video {
            api_url,
            channel_id,
            api_key,
            page_size,
            max_pages,
            assume_sorted,
        } => Arc::new(
            VideoReader::new(client, api_url.clone(), channel_id.clone(), api_key.clone())
                .with_page_size(*page_size)
                .with_max_pages(*max_pages)
                .assume_sorted(*assume_sorted),
        ),
        SourceKind::Engagements { path } => Arc::new(EngagementsReader::new(path.clone())),
    }
}

/// Fetch with a per-attempt timeout, retrying transport failures with
/// exponential backoff. Parse failures are returned immediately.
pub async fn fetch_with_retry(
    reader: &dyn SourceReader,
    since: DateTime<Utc>,
    config: &PollConfig,
) -> Result<Vec<SourceData>, SourceError> {
    let mut attempt: u8 = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(config.request_timeout, reader.fetch_since(since)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(config.request_timeout)),
        };

        match result {
            Ok(items) => return Ok(items),
            Err(err) if err.is_parse() || attempt >= config.max_retries.max(1) => return Err(err),
            Err(err) => {
                let backoff = Duration::from_millis(config.retry_backoff_ms << (attempt - 1).min(16));
                warn!(system = reader.system().as_str(), attempt, error = %err, "source fetch failed, retrying");
                debug!(?backoff, "backing off before retry");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Keep only items strictly newer than `since`.
pub(crate) fn newer_than(items: Vec<SourceData>, since: DateTime<Utc>) -> Vec<SourceData> {
    items.into_iter().filter(|item| item.is_newer_than(since)).collect()
}
