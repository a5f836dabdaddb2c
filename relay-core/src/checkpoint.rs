use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-source ingestion watermark.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub source_name: String,
    pub last_checked_at: DateTime<Utc>,
    pub last_item_seen_at: DateTime<Utc>,
    pub last_updated_on: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl Checkpoint {
    /// The state of a source that has never been polled: everything is new.
    pub fn initial(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            last_checked_at: DateTime::UNIX_EPOCH,
            last_item_seen_at: DateTime::UNIX_EPOCH,
            last_updated_on: DateTime::UNIX_EPOCH,
            version: 0,
        }
    }

    /// Record a completed poll. The watermark only moves forward, and only as
    /// far as the newest timestamp the poll actually returned.
    pub fn advance(&mut self, observed_max: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        if let Some(observed) = observed_max {
            if observed > self.last_item_seen_at {
                self.last_item_seen_at = observed;
            }
        }
        if self.last_checked_at != now {
            self.last_checked_at = now;
            self.last_updated_on = now;
        }
    }
}
