use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use relay_core::store::ScheduledItemRepository;
use relay_core::{
    dispatch_due, ChannelQueue, DispatchConfig, JsonStore, OriginKey, Platform, PlatformQueue,
    QueueError, QueueMessage, RetryPolicy, ScheduledItem, SourceTable,
};
use tokio::sync::Mutex;

fn origin(pk: &str) -> OriginKey {
    OriginKey {
        table: SourceTable::SourceData,
        primary_key: pk.into(),
        secondary_key: None,
    }
}

/// Records every message; yields once per enqueue so concurrent ticks
/// interleave.
#[derive(Default)]
struct RecordingQueue {
    messages: Mutex<Vec<QueueMessage>>,
}

#[async_trait]
impl PlatformQueue for RecordingQueue {
    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError> {
        tokio::task::yield_now().await;
        self.messages.lock().await.push(message);
        Ok(())
    }
}

struct ClosedQueue {
    calls: AtomicUsize,
}

#[async_trait]
impl PlatformQueue for ClosedQueue {
    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(QueueError::Closed(message.platform.queue_name()))
    }
}

#[tokio::test]
async fn due_records_fire_once_to_every_platform() {
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let store = JsonStore::in_memory();
    let due = ScheduledItem::new(origin("a"), "hello", vec![Platform::Twitter, Platform::LinkedIn], now, now);
    let later = ScheduledItem::new(origin("b"), "later", vec![Platform::Twitter], now + Duration::hours(1), now);
    let due = store.insert_pending(due).await.unwrap();
    store.insert_pending(later).await.unwrap();

    let (queue, mut receivers) = ChannelQueue::new(Platform::ALL, 8);
    let report = dispatch_due(&store, &queue, &DispatchConfig::default(), now).await.unwrap();
    assert_eq!(report.due, 1);
    assert_eq!(report.fired, 1);

    let twitter = receivers.get_mut(&Platform::Twitter).unwrap().try_recv().unwrap();
    assert_eq!(twitter.scheduled_item_id, due.id);
    assert_eq!(twitter.message, "hello");
    assert_eq!(twitter.source_primary_key, "a");
    assert!(receivers.get_mut(&Platform::LinkedIn).unwrap().try_recv().is_ok());
    assert!(receivers.get_mut(&Platform::Bluesky).unwrap().try_recv().is_err());

    let stored = ScheduledItemRepository::get(&store, due.id).await.unwrap().unwrap();
    assert!(stored.message_sent);
    assert_eq!(stored.message_sent_on, Some(now));

    let again = dispatch_due(&store, &queue, &DispatchConfig::default(), now).await.unwrap();
    assert_eq!(again.due, 0);
    assert!(receivers.get_mut(&Platform::Twitter).unwrap().try_recv().is_err());
}

#[tokio::test]
async fn concurrent_ticks_enqueue_and_transition_once() {
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let store = Arc::new(JsonStore::in_memory());
    for pk in ["a", "b", "c"] {
        let item = ScheduledItem::new(origin(pk), pk, vec![Platform::Bluesky], now, now);
        store.insert_pending(item).await.unwrap();
    }
    let queue = Arc::new(RecordingQueue::default());
    let config = DispatchConfig::default();

    let (left, right) = tokio::join!(
        dispatch_due(store.as_ref(), queue.as_ref(), &config, now),
        dispatch_due(store.as_ref(), queue.as_ref(), &config, now),
    );
    let (left, right) = (left.unwrap(), right.unwrap());
    assert_eq!(left.fired + right.fired, 3);
    assert_eq!(left.fired + left.skipped + right.fired + right.skipped, left.due + right.due);

    let messages = queue.messages.lock().await;
    let mut per_item: HashMap<_, usize> = HashMap::new();
    for message in messages.iter() {
        *per_item.entry(message.scheduled_item_id).or_default() += 1;
    }
    assert_eq!(per_item.len(), 3);
    assert!(per_item.values().all(|n| *n == 1));

    let records = ScheduledItemRepository::list(store.as_ref()).await.unwrap();
    assert!(records.iter().all(|r| r.message_sent));
}

#[tokio::test]
async fn enqueue_failures_back_off_then_park() {
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let store = JsonStore::in_memory();
    let item = store
        .insert_pending(ScheduledItem::new(origin("a"), "hi", vec![Platform::Facebook], now, now))
        .await
        .unwrap();
    let queue = ClosedQueue {
        calls: AtomicUsize::new(0),
    };
    let config = DispatchConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::minutes(1),
            max_backoff: Duration::minutes(10),
        },
        ..DispatchConfig::default()
    };

    let first = dispatch_due(&store, &queue, &config, now).await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(first.parked, 0);
    let stored = ScheduledItemRepository::get(&store, item.id).await.unwrap().unwrap();
    assert_eq!(stored.attempts, 1);
    assert!(!stored.message_sent);
    assert_eq!(stored.next_attempt_at, Some(now + Duration::minutes(1)));
    assert!(stored.last_error.as_deref().unwrap_or_default().contains("facebook-post-status-to-page"));

    // Still backing off: nothing is due.
    let waiting = dispatch_due(&store, &queue, &config, now + Duration::seconds(30)).await.unwrap();
    assert_eq!(waiting.due, 0);

    let second = dispatch_due(&store, &queue, &config, now + Duration::minutes(1)).await.unwrap();
    assert_eq!(second.failed, 1);
    let third = dispatch_due(&store, &queue, &config, now + Duration::minutes(5)).await.unwrap();
    assert_eq!(third.parked, 1);

    let parked = ScheduledItemRepository::get(&store, item.id).await.unwrap().unwrap();
    assert_eq!(parked.attempts, 3);
    assert!(parked.parked_on.is_some());
    assert!(!parked.message_sent);

    let after = dispatch_due(&store, &queue, &config, now + Duration::days(1)).await.unwrap();
    assert_eq!(after.due, 0);
    assert_eq!(queue.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn overdue_records_are_reported_as_stuck() {
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let store = JsonStore::in_memory();
    let mut item = ScheduledItem::new(origin("a"), "hi", vec![Platform::Twitter], now - Duration::days(3), now - Duration::days(3));
    item.next_attempt_at = Some(now + Duration::hours(1));
    store.insert_pending(item).await.unwrap();

    let queue = RecordingQueue::default();
    let report = dispatch_due(&store, &queue, &DispatchConfig::default(), now).await.unwrap();
    assert_eq!(report.due, 0);
    assert_eq!(report.stuck, 1);
}

/// Fails every enqueue after another tick has already re-claimed the
/// record, so the failure bookkeeping loses its versioned update.
struct ContendedQueue {
    store: Arc<JsonStore>,
}

#[async_trait]
impl PlatformQueue for ContendedQueue {
    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError> {
        let current = ScheduledItemRepository::get(self.store.as_ref(), message.scheduled_item_id)
            .await
            .unwrap()
            .unwrap();
        let version = current.version;
        self.store.update(current, version).await.unwrap();
        Err(QueueError::Closed(message.platform.queue_name()))
    }
}

fn counter_value(snapshotter: &metrics_util::debugging::Snapshotter, name: &str) -> u64 {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(key, ..)| key.key().name() == name)
        .map(|(.., value)| match value {
            metrics_util::debugging::DebugValue::Counter(n) => n,
            _ => 0,
        })
        .sum()
}

#[tokio::test]
async fn failure_lost_to_a_concurrent_writer_is_not_counted() {
    let recorder = metrics_util::debugging::DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let _guard = metrics::set_default_local_recorder(&recorder);

    let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let store = Arc::new(JsonStore::in_memory());
    let item = store
        .insert_pending(ScheduledItem::new(origin("a"), "hello", vec![Platform::Twitter], now, now))
        .await
        .unwrap();
    let queue = ContendedQueue { store: store.clone() };

    let report = dispatch_due(store.as_ref(), &queue, &DispatchConfig::default(), now).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.parked, 0);

    let stored = ScheduledItemRepository::get(store.as_ref(), item.id).await.unwrap().unwrap();
    assert_eq!(stored.attempts, 0);
    assert_eq!(counter_value(&snapshotter, "relay_dispatch_failures_total"), 0);

    // An uncontended failure is recorded and counted.
    let closed = ClosedQueue {
        calls: AtomicUsize::new(0),
    };
    let later = now + Duration::hours(1);
    let report = dispatch_due(store.as_ref(), &closed, &DispatchConfig::default(), later).await.unwrap();
    assert_eq!(report.failed, 1);
    let stored = ScheduledItemRepository::get(store.as_ref(), item.id).await.unwrap().unwrap();
    assert_eq!(stored.attempts, 1);
    assert_eq!(counter_value(&snapshotter, "relay_dispatch_failures_total"), 1);
}
