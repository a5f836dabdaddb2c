use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::Platform;
use crate::source::{SourceData, SourceSystem};

/// Logical table a dispatch record originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceTable {
    SourceData,
    Engagements,
}

impl SourceTable {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceTable::SourceData => "SourceData",
            SourceTable::Engagements => "Engagements",
        }
    }
}

/// Identifies the content a dispatch record was created for. At most one
/// unsent record may exist per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginKey {
    pub table: SourceTable,
    pub primary_key: String,
    pub secondary_key: Option<String>,
}

impl OriginKey {
    pub fn for_item(item: &SourceData) -> Self {
        let table = match item.source_system {
            SourceSystem::Engagement => SourceTable::Engagements,
            _ => SourceTable::SourceData,
        };
        Self {
            table,
            primary_key: item.id.to_string(),
            secondary_key: None,
        }
    }

    /// Key used for resurfacing an older item, kept apart from the item's
    /// own announcement.
    pub fn for_random_post(item: &SourceData) -> Self {
        Self {
            secondary_key: Some("random".to_string()),
            ..Self::for_item(item)
        }
    }
}

impl fmt::Display for OriginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.secondary_key {
            Some(sk) => write!(f, "{}/{}/{}", self.table.as_str(), self.primary_key, sk),
            None => write!(f, "{}/{}", self.table.as_str(), self.primary_key),
        }
    }
}

/// A unit of outbound work. `Pending` until fired, then `Sent` for good.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledItem {
    pub id: Uuid,
    pub source_table: SourceTable,
    pub source_primary_key: String,
    pub source_secondary_key: Option<String>,
    pub message: String,
    pub platforms: Vec<Platform>,
    pub send_on_date_time: DateTime<Utc>,
    pub message_sent: bool,
    pub message_sent_on: Option<DateTime<Utc>>,
    pub created_on: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parked_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub claimed_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

impl ScheduledItem {
    pub fn new(
        origin: OriginKey,
        message: impl Into<String>,
        platforms: Vec<Platform>,
        send_on_date_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_table: origin.table,
            source_primary_key: origin.primary_key,
            source_secondary_key: origin.secondary_key,
            message: message.into(),
            platforms,
            send_on_date_time,
            message_sent: false,
            message_sent_on: None,
            created_on: now,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            parked_on: None,
            claimed_until: None,
            version: 0,
        }
    }

    pub fn origin(&self) -> OriginKey {
        OriginKey {
            table: self.source_table,
            primary_key: self.source_primary_key.clone(),
            secondary_key: self.source_secondary_key.clone(),
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.message_sent
    }

    /// Ready to fire at `now`: unsent, not parked, past its send time and
    /// backoff, and not leased by another dispatch tick.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending()
            && self.parked_on.is_none()
            && self.send_on_date_time <= now
            && self.next_attempt_at.map_or(true, |at| at <= now)
            && self.claimed_until.map_or(true, |until| until <= now)
    }

    pub fn claim(&mut self, until: DateTime<Utc>) {
        self.claimed_until = Some(until);
    }

    /// Transition to `Sent`. Returns false if the record was already sent.
    pub fn mark_sent(&mut self, now: DateTime<Utc>) -> bool {
        if self.message_sent {
            return false;
        }
        self.message_sent = true;
        self.message_sent_on = Some(now.max(self.created_on));
        self.claimed_until = None;
        self.next_attempt_at = None;
        true
    }

    /// Count a failed firing and schedule the next attempt. Returns true when
    /// the retry budget is spent and the record has been parked.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
        retry: &RetryPolicy,
    ) -> bool {
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.claimed_until = None;
        if self.attempts >= retry.max_attempts {
            self.parked_on = Some(now);
            self.next_attempt_at = None;
            true
        } else {
            self.next_attempt_at = Some(now + retry.backoff(self.attempts));
            false
        }
    }
}

/// Bounded exponential backoff for records whose enqueue keeps failing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_backoff: Duration::minutes(1),
            max_backoff: Duration::hours(6),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1i32 << attempts.saturating_sub(1).min(20);
        (self.base_backoff * factor).min(self.max_backoff)
    }
}

/// Decides when a newly found item should be sent.
pub trait SchedulePolicy: Send + Sync + fmt::Debug {
    /// `index` is the item's position among the items scheduled in the same
    /// cycle.
    fn send_on(&self, item: &SourceData, index: usize, now: DateTime<Utc>) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl SchedulePolicy for Immediate {
    fn send_on(&self, _item: &SourceData, _index: usize, now: DateTime<Utc>) -> DateTime<Utc> {
        now
    }
}

/// Spreads a batch out so platforms are not hit with a burst of posts.
#[derive(Debug, Clone, Copy)]
pub struct Staggered {
    pub delay: Duration,
    pub spacing: Duration,
}

impl SchedulePolicy for Staggered {
    fn send_on(&self, _item: &SourceData, index: usize, now: DateTime<Utc>) -> DateTime<Utc> {
        let index = i32::try_from(index).unwrap_or(i32::MAX);
        now + self.delay + self.spacing * index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item(now: DateTime<Utc>) -> ScheduledItem {
        let origin = OriginKey {
            table: SourceTable::SourceData,
            primary_key: "1".into(),
            secondary_key: None,
        };
        ScheduledItem::new(origin, "msg", vec![Platform::Twitter], now, now)
    }

    #[test]
    fn sent_is_terminal() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut it = item(now);
        assert!(it.mark_sent(now));
        assert!(!it.mark_sent(now + Duration::minutes(1)));
        assert_eq!(it.message_sent_on, Some(now));
        assert!(!it.is_due(now + Duration::days(1)));
    }

    #[test]
    fn failures_back_off_then_park() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let retry = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::minutes(1),
            max_backoff: Duration::minutes(30),
        };
        let mut it = item(now);
        assert!(!it.record_failure("boom", now, &retry));
        assert_eq!(it.next_attempt_at, Some(now + Duration::minutes(1)));
        assert!(!it.is_due(now));
        assert!(it.is_due(now + Duration::minutes(1)));

        assert!(!it.record_failure("boom", now, &retry));
        assert_eq!(it.next_attempt_at, Some(now + Duration::minutes(2)));

        assert!(it.record_failure("boom", now, &retry));
        assert_eq!(it.parked_on, Some(now));
        assert!(!it.is_due(now + Duration::days(30)));
        assert!(it.is_pending());
    }

    #[test]
    fn claimed_items_are_not_due_until_lease_expires() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut it = item(now);
        it.claim(now + Duration::minutes(5));
        assert!(!it.is_due(now));
        assert!(it.is_due(now + Duration::minutes(5)));
    }

    #[test]
    fn staggered_spaces_batch() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let policy = Staggered {
            delay: Duration::minutes(10),
            spacing: Duration::minutes(30),
        };
        let data = crate::source::SourceData::new(
            SourceSystem::JsonFeed,
            "x",
            "t",
            "u",
            now,
            now,
        );
        assert_eq!(policy.send_on(&data, 0, now), now + Duration::minutes(10));
        assert_eq!(policy.send_on(&data, 2, now), now + Duration::minutes(70));
    }

    #[test]
    fn backoff_is_capped() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff(1), Duration::minutes(1));
        assert_eq!(retry.backoff(3), Duration::minutes(4));
        assert_eq!(retry.backoff(30), Duration::hours(6));
    }
}
