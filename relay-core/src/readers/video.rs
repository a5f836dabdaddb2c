use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::SourceReader;
use crate::error::SourceError;
use crate::source::{SourceData, SourceSystem};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchPage {
    next_page_token: Option<String>,
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: VideoId,
    snippet: Snippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoId {
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    published_at: DateTime<Utc>,
    title: String,
    channel_title: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

/// Reads a channel's uploads from a date-ordered, paged search endpoint.
///
/// With `assume_sorted` (the default) paging stops at the first page whose
/// oldest video is at or before the watermark. That is only correct while the
/// platform keeps returning newest-first; turn it off to scan every page up to
/// `max_pages` and filter afterwards.
pub struct VideoReader {
    client: Client,
    api_url: String,
    channel_id: String,
    api_key: Option<String>,
    page_size: u32,
    max_pages: u32,
    assume_sorted: bool,
}

impl VideoReader {
    pub fn new(
        client: Client,
        api_url: impl Into<String>,
        channel_id: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            channel_id: channel_id.into(),
            api_key,
            page_size: 25,
            max_pages: 20,
            assume_sorted: true,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn assume_sorted(mut self, assume_sorted: bool) -> Self {
        self.assume_sorted = assume_sorted;
        self
    }

    fn page_url(&self, page_token: Option<&str>) -> Result<Url, SourceError> {
        let mut url = Url::parse(&self.api_url)
            .map_err(|e| SourceError::Malformed(format!("video api url: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("part", "snippet")
                .append_pair("channelId", &self.channel_id)
                .append_pair("order", "date")
                .append_pair("type", "video")
                .append_pair("maxResults", &self.page_size.to_string());
            if let Some(key) = &self.api_key {
                query.append_pair("key", key);
            }
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }
        Ok(url)
    }

    async fn fetch_page(&self, page_token: Option<&str>) -> Result<SearchPage, SourceError> {
        let url = self.page_url(page_token)?;
        let response = self.client.get(url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn to_source_data(item: SearchItem, now: DateTime<Utc>) -> Option<SourceData> {
    let video_id = item.id.video_id?;
    let url = format!("https://www.youtube.com/watch?v={video_id}");
    let mut data = SourceData::new(
        SourceSystem::Video,
        video_id,
        item.snippet.title,
        url,
        item.snippet.published_at,
        now,
    );
    data.author = item.snippet.channel_title;
    data.tags = item.snippet.tags.into_iter().collect();
    Some(data)
}

#[async_trait]
impl SourceReader for VideoReader {
    fn system(&self) -> SourceSystem {
        SourceSystem::Video
    }

    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<SourceData>, SourceError> {
        let now = Utc::now();
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;

        let mut exhausted = false;
        for page_number in 0..self.max_pages {
            let page = self.fetch_page(page_token.as_deref()).await?;
            let oldest = page.items.iter().map(|i| i.snippet.published_at).min();

            out.extend(
                page.items
                    .into_iter()
                    .filter_map(|item| to_source_data(item, now))
                    .filter(|item| item.is_newer_than(since)),
            );

            if self.assume_sorted && oldest.is_some_and(|oldest| oldest <= since) {
                debug!(page_number, "reached watermark, stopping pagination");
                exhausted = true;
                break;
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => {
                    exhausted = true;
                    break;
                }
            }
        }

        if !exhausted {
            warn!(
                channel = %self.channel_id,
                max_pages = self.max_pages,
                since = %since,
                "page limit reached before the watermark; older new videos were not read"
            );
        }
        Ok(out)
    }
}
