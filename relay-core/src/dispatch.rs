//! Firing due dispatch records into platform queues.
//!
//! Each record is claimed with a versioned update before anything is
//! enqueued, so two overlapping ticks cannot both fire it. The sent flag is
//! set with a second versioned update after every platform accepted the
//! message.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::queue::{PlatformQueue, QueueMessage};
use crate::schedule::{RetryPolicy, ScheduledItem};
use crate::store::ScheduledItemRepository;
use crate::telemetry;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchConfig {
    /// How long a claim keeps other ticks away from a record.
    pub claim_ttl: Duration,
    pub enqueue_timeout: StdDuration,
    pub retry: RetryPolicy,
    /// Pending records older than this are reported on every tick.
    pub stuck_after: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            claim_ttl: Duration::minutes(5),
            enqueue_timeout: StdDuration::from_secs(10),
            retry: RetryPolicy::default(),
            stuck_after: Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub due: usize,
    pub fired: usize,
    /// Records another tick claimed first.
    pub skipped: usize,
    pub failed: usize,
    pub parked: usize,
    pub stuck: usize,
}

/// Fire every record due at `now`, oldest first.
pub async fn dispatch_due(
    scheduled: &dyn ScheduledItemRepository,
    queue: &dyn PlatformQueue,
    config: &DispatchConfig,
    now: DateTime<Utc>,
) -> Result<DispatchReport, StoreError> {
    let due = scheduled.due(now).await?;
    let mut report = DispatchReport {
        due: due.len(),
        ..DispatchReport::default()
    };

    for item in due {
        let Some(claimed) = claim(scheduled, item, now + config.claim_ttl).await? else {
            report.skipped += 1;
            continue;
        };

        match enqueue_all(queue, &claimed, config.enqueue_timeout, now).await {
            Ok(()) => {
                if mark_sent(scheduled, claimed, now).await? {
                    report.fired += 1;
                }
            }
            Err(reason) => {
                report.failed += 1;
                if record_failure(scheduled, claimed, reason, &config.retry, now).await? {
                    report.parked += 1;
                }
            }
        }
    }

    report.stuck = warn_stuck(scheduled, config.stuck_after, now).await?;
    if report.due > 0 {
        info!(
            due = report.due,
            fired = report.fired,
            skipped = report.skipped,
            failed = report.failed,
            parked = report.parked,
            "dispatch tick complete"
        );
    }
    Ok(report)
}

async fn claim(
    scheduled: &dyn ScheduledItemRepository,
    item: ScheduledItem,
    until: DateTime<Utc>,
) -> Result<Option<ScheduledItem>, StoreError> {
    let version = item.version;
    let mut claimed = item;
    claimed.claim(until);
    match scheduled.update(claimed, version).await {
        Ok(claimed) => Ok(Some(claimed)),
        Err(err) if err.is_conflict() => {
            debug!(error = %err, "record claimed by another tick");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

async fn enqueue_all(
    queue: &dyn PlatformQueue,
    item: &ScheduledItem,
    timeout: StdDuration,
    now: DateTime<Utc>,
) -> Result<(), String> {
    if item.platforms.is_empty() {
        warn!(id = %item.id, "dispatch record has no platforms; marking sent");
    }
    for platform in &item.platforms {
        let message = QueueMessage::for_item(item, *platform, now);
        match tokio::time::timeout(timeout, queue.enqueue(message)).await {
            Ok(Ok(())) => {
                telemetry::record_fired(*platform);
                debug!(id = %item.id, queue = platform.queue_name(), "enqueued");
            }
            Ok(Err(err)) => return Err(err.to_string()),
            Err(_) => {
                return Err(format!(
                    "enqueue to `{}` timed out after {timeout:?}",
                    platform.queue_name()
                ))
            }
        }
    }
    Ok(())
}

async fn mark_sent(
    scheduled: &dyn ScheduledItemRepository,
    claimed: ScheduledItem,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let version = claimed.version;
    let id = claimed.id;
    let mut sent = claimed;
    if !sent.mark_sent(now) {
        return Ok(false);
    }
    match scheduled.update(sent, version).await {
        Ok(_) => {
            info!(id = %id, "dispatch record fired");
            Ok(true)
        }
        Err(err) if err.is_conflict() => {
            warn!(id = %id, error = %err, "could not mark record sent; it may be delivered again");
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

async fn record_failure(
    scheduled: &dyn ScheduledItemRepository,
    claimed: ScheduledItem,
    reason: String,
    retry: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let version = claimed.version;
    let mut failed = claimed;
    let parked = failed.record_failure(reason.clone(), now, retry);
    let id = failed.id;
    let attempts = failed.attempts;
    let next_attempt_at = failed.next_attempt_at;
    match scheduled.update(failed, version).await {
        Ok(_) => {
            telemetry::record_dispatch_failure(parked);
            if parked {
                error!(id = %id, attempts, error = %reason, "dispatch record parked after repeated failures");
            } else {
                warn!(id = %id, attempts, error = %reason, next_attempt_at = ?next_attempt_at, "enqueue failed; will retry");
            }
            Ok(parked)
        }
        Err(err) if err.is_conflict() => {
            debug!(id = %id, "failure bookkeeping lost a race");
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

async fn warn_stuck(
    scheduled: &dyn ScheduledItemRepository,
    stuck_after: Duration,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let stuck: Vec<ScheduledItem> = scheduled
        .list()
        .await?
        .into_iter()
        .filter(|item| item.is_pending() && item.parked_on.is_none())
        .filter(|item| item.send_on_date_time + stuck_after < now)
        .collect();
    for item in &stuck {
        warn!(
            id = %item.id,
            origin = %item.origin(),
            send_on = %item.send_on_date_time,
            attempts = item.attempts,
            "dispatch record pending past its send time"
        );
    }
    Ok(stuck.len())
}
