use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, PollSettings, RandomPostSettings};
use crate::dispatch::{dispatch_due, DispatchConfig, DispatchReport};
use crate::error::{ConfigError, IngestError, PollError};
use crate::ingest::{poll_source, schedule_random_post, ConfiguredSource, PollReport, Repositories};
use crate::publish::PlatformWorker;
use crate::queue::{Platform, PlatformQueue, QueueMessage};
use crate::rotation::{RotationManager, RotationOutcome, TokenType};
use crate::schedule::ScheduledItem;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollConfig {
    pub interval: Duration,
    pub dispatch_interval: Duration,
    /// Bound on a single source fetch attempt.
    pub request_timeout: Duration,
    pub max_retries: u8,
    pub retry_backoff_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::from(&PollSettings::default())
    }
}

impl From<&PollSettings> for PollConfig {
    fn from(settings: &PollSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_minutes.max(1) * 60),
            dispatch_interval: Duration::from_secs(settings.dispatch_interval_seconds.max(1)),
            request_timeout: Duration::from_secs(settings.request_timeout_seconds.max(1)),
            max_retries: settings.retry_attempts,
            retry_backoff_ms: settings.retry_backoff_ms,
        }
    }
}

impl PollConfig {
    /// Read the `poll` section of a config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = AppConfig::load_from(path.as_ref())?;
        Ok(Self::from(&config.poll))
    }
}

/// Something the background tasks did, for the service to log or act on.
#[derive(Debug, Clone)]
pub enum Event {
    Ingested(PollReport),
    SourceFailed { source: String, error: String },
    Dispatched(DispatchReport),
    RandomPostScheduled(ScheduledItem),
    TokenRotated { token: TokenType, outcome: RotationOutcome },
    RotationFailed { token: TokenType, error: String },
}

/// Poll every source once, concurrently. Failures are reported per source
/// and never stop the other sources.
pub async fn poll_once(
    sources: &[ConfiguredSource],
    repos: &Repositories,
    config: &PollConfig,
    now: DateTime<Utc>,
) -> Vec<Result<PollReport, (String, IngestError)>> {
    join_all(sources.iter().map(|source| async move {
        poll_source(source, repos, config, now)
            .await
            .map_err(|err| (source.name.clone(), err))
    }))
    .await
}

/// Everything the scheduler timers need.
#[derive(Clone)]
pub struct Scheduler {
    pub sources: Vec<ConfiguredSource>,
    pub repos: Repositories,
    pub queue: Arc<dyn PlatformQueue>,
    pub dispatch: DispatchConfig,
    pub random_post: Option<RandomPostSettings>,
}

pub struct PollerHandle {
    cancel_tx: broadcast::Sender<()>,
    joins: Vec<JoinHandle<()>>,
}

impl PollerHandle {
    pub async fn stop(self) -> Result<(), PollError> {
        let _ = self.cancel_tx.send(());
        for join in self.joins {
            join.await?;
        }
        Ok(())
    }
}

async fn emit(events: &mpsc::Sender<Event>, event: Event) {
    if events.send(event).await.is_err() {
        debug!("event receiver dropped");
    }
}

/// Run the poll, dispatch and random-post timers until stopped.
pub fn spawn_scheduler(
    scheduler: Scheduler,
    config: PollConfig,
    events: mpsc::Sender<Event>,
) -> PollerHandle {
    let (cancel_tx, mut cancel_rx) = broadcast::channel(1);
    let join = tokio::spawn(async move {
        let mut poll_ticker = tokio::time::interval(config.interval);
        poll_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut dispatch_ticker = tokio::time::interval(config.dispatch_interval);
        dispatch_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let random_every = scheduler
            .random_post
            .as_ref()
            .filter(|settings| settings.enabled)
            .map(|settings| Duration::from_secs(settings.interval_minutes.max(1) * 60))
            .unwrap_or(Duration::from_secs(24 * 60 * 60));
        let mut random_ticker = tokio::time::interval(random_every);
        random_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut rng = StdRng::from_os_rng();

        loop {
            tokio::select! {
                _ = cancel_rx.recv() => {
                    info!("scheduler shutdown requested");
                    break;
                }
                _ = poll_ticker.tick() => {
                    let results = poll_once(&scheduler.sources, &scheduler.repos, &config, Utc::now()).await;
                    for result in results {
                        let event = match result {
                            Ok(report) => Event::Ingested(report),
                            Err((source, err)) => Event::SourceFailed { source, error: err.to_string() },
                        };
                        emit(&events, event).await;
                    }
                }
                _ = dispatch_ticker.tick() => {
                    match dispatch_due(scheduler.repos.scheduled.as_ref(), scheduler.queue.as_ref(), &scheduler.dispatch, Utc::now()).await {
                        Ok(report) => {
                            if report.due > 0 || report.stuck > 0 {
                                emit(&events, Event::Dispatched(report)).await;
                            }
                        }
                        Err(err) => warn!(error = %err, "dispatch tick failed"),
                    }
                }
                _ = random_ticker.tick() => {
                    let Some(settings) = scheduler.random_post.as_ref().filter(|s| s.enabled) else {
                        continue;
                    };
                    let now = Utc::now();
                    let plan = settings.to_plan(now);
                    match schedule_random_post(&scheduler.repos, &plan, now, &mut rng).await {
                        Ok(Some(item)) => emit(&events, Event::RandomPostScheduled(item)).await,
                        Ok(None) => {}
                        Err(err) => warn!(error = %err, "random post tick failed"),
                    }
                }
            }
        }
    });

    PollerHandle {
        cancel_tx,
        joins: vec![join],
    }
}

/// Check registered tokens on their own timer.
pub fn spawn_rotation(
    manager: RotationManager,
    interval: Duration,
    events: mpsc::Sender<Event>,
) -> PollerHandle {
    let (cancel_tx, mut cancel_rx) = broadcast::channel(1);
    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel_rx.recv() => {
                    info!("rotation shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    for (token, result) in manager.tick(Utc::now()).await {
                        let event = match result {
                            Ok(outcome) => Event::TokenRotated { token, outcome },
                            Err(err) => Event::RotationFailed { token, error: err.to_string() },
                        };
                        emit(&events, event).await;
                    }
                }
            }
        }
    });

    PollerHandle {
        cancel_tx,
        joins: vec![join],
    }
}

/// Start one worker per platform queue. Queues without a worker are
/// drained and logged so enqueues never stall.
pub fn spawn_platform_workers(
    workers: Vec<PlatformWorker>,
    mut receivers: std::collections::HashMap<Platform, mpsc::Receiver<QueueMessage>>,
) -> PollerHandle {
    let (cancel_tx, _) = broadcast::channel(1);
    let mut joins = Vec::new();
    for worker in workers {
        let Some(queue) = receivers.remove(&worker.platform()) else {
            warn!(queue = worker.platform().queue_name(), "no queue for platform worker");
            continue;
        };
        joins.push(tokio::spawn(worker.run(queue, cancel_tx.subscribe())));
    }
    for (platform, mut queue) in receivers {
        let mut cancel = cancel_tx.subscribe();
        joins.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.recv() => break,
                    next = queue.recv() => match next {
                        Some(message) => warn!(
                            queue = platform.queue_name(),
                            id = %message.scheduled_item_id,
                            "no publisher configured; dropping message"
                        ),
                        None => break,
                    }
                }
            }
        }));
    }
    PollerHandle { cancel_tx, joins }
}
