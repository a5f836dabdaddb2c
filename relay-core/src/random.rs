use chrono::{DateTime, Utc};
use rand::seq::IndexedRandom;
use rand::Rng;

use crate::source::SourceData;

/// Filter for the "resurface an older item" query.
#[derive(Debug, Clone, PartialEq)]
pub struct RandomQuery {
    /// Only items published at or after this date are eligible.
    pub cutoff: DateTime<Utc>,
    /// Tags (case-insensitive) that disqualify an item.
    pub excluded_tags: Vec<String>,
}

impl RandomQuery {
    pub fn is_eligible(&self, item: &SourceData, now: DateTime<Utc>) -> bool {
        item.publication_date >= self.cutoff
            && !item.is_expired(now)
            && !item.has_any_tag(&self.excluded_tags)
    }
}

/// Pick one eligible item uniformly at random, or `None` if nothing
/// qualifies.
pub fn pick_random<'a, R: Rng + ?Sized>(
    items: &'a [SourceData],
    query: &RandomQuery,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Option<&'a SourceData> {
    let eligible: Vec<&SourceData> = items
        .iter()
        .filter(|item| query.is_eligible(item, now))
        .collect();
    eligible.choose(rng).copied()
}
