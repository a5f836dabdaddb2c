use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

use super::{newer_than, SourceReader};
use crate::error::SourceError;
use crate::source::{SourceData, SourceSystem};

// https://www.jsonfeed.org/version/1.1/
#[derive(Debug, Deserialize)]
struct JsonFeed {
    #[serde(default)]
    authors: Vec<Author>,
    #[serde(default)]
    items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Author {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Item {
    id: String,
    url: Option<String>,
    external_url: Option<String>,
    title: Option<String>,
    date_published: Option<DateTime<Utc>>,
    date_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    authors: Vec<Author>,
}

pub struct JsonFeedReader {
    client: Client,
    url: String,
}

impl JsonFeedReader {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn parse(body: &[u8], now: DateTime<Utc>) -> Result<Vec<SourceData>, SourceError> {
        let feed: JsonFeed = serde_json::from_slice(body)?;
        let feed_author = feed.authors.iter().find_map(|a| a.name.clone());

        let items = feed
            .items
            .into_iter()
            .filter_map(|item| {
                let published = item.date_published.or(item.date_modified)?;
                let url = item.url.or(item.external_url).unwrap_or_default();
                let mut data = SourceData::new(
                    SourceSystem::JsonFeed,
                    item.id,
                    item.title.unwrap_or_default(),
                    url,
                    published,
                    now,
                );
                data.updated_on_date = item.date_modified.unwrap_or(published).max(published);
                data.author = item
                    .authors
                    .into_iter()
                    .find_map(|a| a.name)
                    .or_else(|| feed_author.clone());
                data.tags = item
                    .tags
                    .into_iter()
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect();
                Some(data)
            })
            .collect();
        Ok(items)
    }
}

#[async_trait]
impl SourceReader for JsonFeedReader {
    fn system(&self) -> SourceSystem {
        SourceSystem::JsonFeed
    }

    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<SourceData>, SourceError> {
        let response = self.client.get(&self.url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        let items = Self::parse(&bytes, Utc::now())?;
        Ok(newer_than(items, since))
    }
}
