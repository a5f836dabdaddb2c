use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;

use super::{newer_than, SourceReader};
use crate::error::SourceError;
use crate::feed::parse_feed;
use crate::source::{SourceData, SourceSystem};

/// RSS 2.0 / Atom reader.
pub struct SyndicationReader {
    client: Client,
    url: String,
}

impl SyndicationReader {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl SourceReader for SyndicationReader {
    fn system(&self) -> SourceSystem {
        SourceSystem::SyndicationFeed
    }

    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<SourceData>, SourceError> {
        let response = self.client.get(&self.url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        let items = parse_feed(&bytes, Utc::now())?;
        Ok(newer_than(items, since))
    }
}
