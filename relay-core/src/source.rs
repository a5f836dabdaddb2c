use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The content system an item was observed in. Identities are only unique
/// within one system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceSystem {
    SyndicationFeed,
    JsonFeed,
    Video,
    Engagement,
}

impl SourceSystem {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceSystem::SyndicationFeed => "syndication_feed",
            SourceSystem::JsonFeed => "json_feed",
            SourceSystem::Video => "video",
            SourceSystem::Engagement => "engagement",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceData {
    pub id: Uuid,
    pub source_system: SourceSystem,
    pub identity: String,
    pub title: String,
    pub author: Option<String>,
    pub url: String,
    pub shortened_url: Option<String>,
    pub tags: BTreeSet<String>,
    pub publication_date: DateTime<Utc>,
    pub updated_on_date: DateTime<Utc>,
    pub added_on: DateTime<Utc>,
    pub end_after: Option<DateTime<Utc>>,
}

impl SourceData {
    /// A freshly observed item. `updated_on_date` starts equal to the
    /// publication date; readers overwrite it when the source reports one.
    pub fn new(
        source_system: SourceSystem,
        identity: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
        publication_date: DateTime<Utc>,
        added_on: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_system,
            identity: identity.into(),
            title: title.into(),
            author: None,
            url: url.into(),
            shortened_url: None,
            tags: BTreeSet::new(),
            publication_date,
            updated_on_date: publication_date,
            added_on,
            end_after: None,
        }
    }

    /// Latest of the publication and update dates; this is what watermarks
    /// are compared against.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.publication_date.max(self.updated_on_date)
    }

    pub fn is_newer_than(&self, since: DateTime<Utc>) -> bool {
        self.publication_date > since || self.updated_on_date > since
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.end_after.is_some_and(|end| end < now)
    }

    pub fn has_any_tag(&self, excluded: &[String]) -> bool {
        self.tags
            .iter()
            .any(|tag| excluded.iter().any(|ex| ex.eq_ignore_ascii_case(tag)))
    }

    /// Link to put in outbound messages: the shortened form when one exists.
    pub fn link(&self) -> &str {
        self.shortened_url.as_deref().unwrap_or(&self.url)
    }
}
