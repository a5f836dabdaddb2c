//! One poll cycle per source: read the watermark, fetch, upsert, schedule,
//! and only then move the watermark.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::checkpoint::Checkpoint;
use crate::error::{IngestError, StoreError};
use crate::message::{render, MessageKind};
use crate::poller::PollConfig;
use crate::queue::Platform;
use crate::random::{pick_random, RandomQuery};
use crate::readers::{fetch_with_retry, SourceReader};
use crate::schedule::{OriginKey, ScheduledItem, SchedulePolicy};
use crate::source::SourceData;
use crate::store::{
    CheckpointRepository, ScheduledItemRepository, SourceDataRepository, UpsertOutcome,
};
use crate::telemetry;

/// A source as the scheduler sees it: where to read, when to send, and
/// which platforms to fan out to.
#[derive(Clone)]
pub struct ConfiguredSource {
    pub name: String,
    pub reader: Arc<dyn SourceReader>,
    pub policy: Arc<dyn SchedulePolicy>,
    pub platforms: Vec<Platform>,
}

impl fmt::Debug for ConfiguredSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfiguredSource")
            .field("name", &self.name)
            .field("system", &self.reader.system())
            .field("policy", &self.policy)
            .field("platforms", &self.platforms)
            .finish()
    }
}

/// The repositories a scheduler tick touches.
#[derive(Clone)]
pub struct Repositories {
    pub source_data: Arc<dyn SourceDataRepository>,
    pub checkpoints: Arc<dyn CheckpointRepository>,
    pub scheduled: Arc<dyn ScheduledItemRepository>,
}

impl Repositories {
    /// Use one store for all three repositories.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: SourceDataRepository + CheckpointRepository + ScheduledItemRepository + 'static,
    {
        Self {
            source_data: store.clone(),
            checkpoints: store.clone(),
            scheduled: store,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollReport {
    pub source: String,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub scheduled: usize,
    pub watermark: DateTime<Utc>,
}

/// Run one poll cycle for `source`.
///
/// On a fetch failure nothing is written and the error is returned. A
/// conflict on a dispatch insert means a pending record already exists for
/// that origin and is not an error; neither is a conflict on the checkpoint
/// write, which means a concurrent poll got there first.
pub async fn poll_source(
    source: &ConfiguredSource,
    repos: &Repositories,
    config: &PollConfig,
    now: DateTime<Utc>,
) -> Result<PollReport, IngestError> {
    let stored = repos.checkpoints.get(&source.name).await?;
    let expected_version = stored.as_ref().map(|cp| cp.version);
    let before = stored.unwrap_or_else(|| Checkpoint::initial(source.name.clone()));
    let since = before.last_item_seen_at;

    let items = match fetch_with_retry(source.reader.as_ref(), since, config).await {
        Ok(items) => items,
        Err(err) => {
            telemetry::record_source_error(&source.name);
            warn!(source = %source.name, error = %err, "poll failed; checkpoint left as is");
            return Err(err.into());
        }
    };

    let mut report = PollReport {
        source: source.name.clone(),
        fetched: items.len(),
        inserted: 0,
        updated: 0,
        scheduled: 0,
        watermark: since,
    };
    let observed_max = items.iter().map(|item| item.last_activity()).max();

    let mut to_schedule = Vec::new();
    for item in items {
        let upserted = repos.source_data.upsert(item).await?;
        match upserted.outcome {
            UpsertOutcome::Inserted => {
                report.inserted += 1;
                to_schedule.push((upserted.record, MessageKind::New));
            }
            UpsertOutcome::Updated => {
                report.updated += 1;
                to_schedule.push((upserted.record, MessageKind::Updated));
            }
            // Stored by an earlier poll that failed before scheduling it.
            UpsertOutcome::Unchanged => {
                if let Some(kind) = unannounced(repos, &upserted.record).await? {
                    to_schedule.push((upserted.record, kind));
                }
            }
        }
    }

    for (index, (record, kind)) in to_schedule.iter().enumerate() {
        if record.is_expired(now) {
            debug!(source = %source.name, identity = %record.identity, "item already ended; not scheduling");
            continue;
        }
        let send_on = source.policy.send_on(record, index, now);
        let pending = ScheduledItem::new(
            OriginKey::for_item(record),
            render(record, *kind),
            source.platforms.clone(),
            send_on,
            now,
        );
        match repos.scheduled.insert_pending(pending).await {
            Ok(inserted) => {
                report.scheduled += 1;
                debug!(source = %source.name, id = %inserted.id, send_on = %inserted.send_on_date_time, "item scheduled");
            }
            Err(err) if err.is_conflict() => {
                debug!(source = %source.name, identity = %record.identity, "dispatch already pending for item");
            }
            Err(err) => return Err(err.into()),
        }
    }

    let mut after = before.clone();
    after.advance(observed_max, now);
    report.watermark = after.last_item_seen_at;
    if after != before {
        match repos.checkpoints.save(after, expected_version).await {
            Ok(saved) => report.watermark = saved.last_item_seen_at,
            Err(err) if err.is_conflict() => {
                debug!(source = %source.name, "checkpoint advanced by a concurrent poll");
            }
            Err(err) => return Err(err.into()),
        }
    }

    telemetry::record_ingested(&source.name, report.inserted + report.updated);
    telemetry::record_scheduled(&source.name, report.scheduled);
    if report.inserted + report.updated > 0 {
        info!(
            source = %source.name,
            inserted = report.inserted,
            updated = report.updated,
            scheduled = report.scheduled,
            watermark = %report.watermark,
            "ingested new items"
        );
    }
    Ok(report)
}

/// Whether an already-stored item still lacks a dispatch record covering
/// its latest activity, and with which message.
async fn unannounced(
    repos: &Repositories,
    record: &SourceData,
) -> Result<Option<MessageKind>, StoreError> {
    let latest = repos
        .scheduled
        .latest_for_origin(&OriginKey::for_item(record))
        .await?;
    Ok(match latest {
        None => Some(MessageKind::New),
        Some(existing) if existing.created_on < record.last_activity() => Some(MessageKind::Updated),
        Some(_) => None,
    })
}

/// How the periodic "resurface an older item" post is chosen and sent.
#[derive(Debug, Clone, PartialEq)]
pub struct RandomPostPlan {
    pub query: RandomQuery,
    pub delay: Duration,
    pub platforms: Vec<Platform>,
}

/// Schedule one randomly chosen eligible item. Returns `None` when nothing
/// qualifies or the chosen item already has a pending random post.
pub async fn schedule_random_post<R: Rng + ?Sized>(
    repos: &Repositories,
    plan: &RandomPostPlan,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Result<Option<ScheduledItem>, StoreError> {
    let items = repos.source_data.list().await?;
    let Some(item) = pick_random(&items, &plan.query, now, rng) else {
        debug!("no eligible item for a random post");
        return Ok(None);
    };

    let pending = ScheduledItem::new(
        OriginKey::for_random_post(item),
        render(item, MessageKind::Random),
        plan.platforms.clone(),
        now + plan.delay,
        now,
    );
    match repos.scheduled.insert_pending(pending).await {
        Ok(inserted) => {
            telemetry::record_scheduled("random", 1);
            info!(identity = %item.identity, id = %inserted.id, "random post scheduled");
            Ok(Some(inserted))
        }
        Err(err) if err.is_conflict() => {
            debug!(identity = %item.identity, "random post already pending for item");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
