use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::SourceError;
use crate::source::{SourceData, SourceSystem};

/// Parse an RSS 2.0 or Atom document into source items.
///
/// RSS is tried first; if that fails the body is read as Atom, and when both
/// fail the RSS error is reported.
pub fn parse_feed(body: &Bytes, now: DateTime<Utc>) -> Result<Vec<SourceData>, SourceError> {
    match rss::Channel::read_from(body.as_ref()) {
        Ok(channel) => Ok(channel
            .items()
            .iter()
            .filter_map(|item| from_rss_item(item, now))
            .collect()),
        Err(rss_err) => match atom_syndication::Feed::read_from(body.as_ref()) {
            Ok(feed) => Ok(feed
                .entries()
                .iter()
                .filter_map(|entry| from_atom_entry(entry, now))
                .collect()),
            Err(_) => Err(rss_err.into()),
        },
    }
}

pub fn from_rss_item(item: &rss::Item, now: DateTime<Utc>) -> Option<SourceData> {
    let identity = item
        .guid()
        .map(|guid| guid.value().to_owned())
        .or_else(|| item.link().map(ToOwned::to_owned))?;

    // Items without any usable date cannot be placed against a watermark.
    let published = item
        .pub_date()
        .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
        .or_else(|| {
            item.dublin_core_ext()
                .and_then(|dc| dc.dates().first())
                .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        })
        .map(|dt| dt.with_timezone(&Utc));
    let Some(published) = published else {
        debug!(identity = %identity, "skipping rss item without a date");
        return None;
    };

    let mut data = SourceData::new(
        SourceSystem::SyndicationFeed,
        identity,
        item.title().unwrap_or_default(),
        item.link().unwrap_or_default(),
        published,
        now,
    );

    data.author = item
        .dublin_core_ext()
        .and_then(|dc| dc.creators().first().map(|s| s.to_string()))
        .or_else(|| item.author().map(|s| s.to_string()));

    data.tags = item
        .categories()
        .iter()
        .map(|cat| cat.name().trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();

    Some(data)
}

pub fn from_atom_entry(entry: &atom_syndication::Entry, now: DateTime<Utc>) -> Option<SourceData> {
    let identity = entry.id().trim();
    if identity.is_empty() {
        return None;
    }

    let url = entry
        .links()
        .iter()
        .find(|link| link.rel() == "alternate")
        .or_else(|| entry.links().first())
        .map(|link| link.href().to_owned())
        .unwrap_or_default();

    let updated = entry.updated().with_timezone(&Utc);
    let published = entry
        .published()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(updated);

    let mut data = SourceData::new(
        SourceSystem::SyndicationFeed,
        identity,
        entry.title().value.clone(),
        url,
        published,
        now,
    );
    data.updated_on_date = updated.max(published);
    data.author = entry.authors().first().map(|person| person.name().to_owned());
    data.tags = entry
        .categories()
        .iter()
        .map(|cat| cat.term().trim().to_string())
        .filter(|term| !term.is_empty())
        .collect();

    Some(data)
}
