use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use relay_core::{
    spawn_platform_workers, ChannelQueue, Delivery, Platform, PlatformQueue, PlatformWorker,
    PublishError, Publisher, QueueMessage, SourceTable, WebhookPublisher,
};
use reqwest::Client;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn message(platform: Platform, id: Uuid) -> QueueMessage {
    QueueMessage {
        scheduled_item_id: id,
        platform,
        message: "New post: Hello https://ex.com".into(),
        source_table: SourceTable::SourceData,
        source_primary_key: "pk".into(),
        source_secondary_key: None,
        enqueued_at: Utc::now(),
    }
}

#[derive(Default)]
struct CountingPublisher {
    calls: AtomicUsize,
    fail_first: usize,
}

#[async_trait]
impl Publisher for CountingPublisher {
    async fn publish(&self, message: &QueueMessage) -> Result<String, PublishError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            return Err(PublishError::Rejected("rate limited".into()));
        }
        Ok(format!("post-{}", message.scheduled_item_id))
    }
}

#[tokio::test]
async fn redelivered_message_is_published_once() {
    let publisher = Arc::new(CountingPublisher::default());
    let mut worker = PlatformWorker::new(Platform::Bluesky, publisher.clone());
    let id = Uuid::new_v4();

    let first = worker.handle(message(Platform::Bluesky, id)).await;
    let second = worker.handle(message(Platform::Bluesky, id)).await;
    assert_eq!(first, Delivery::Published(format!("post-{id}")));
    assert_eq!(second, Delivery::Duplicate);
    assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transient_failures_are_retried_then_given_up() {
    let publisher = Arc::new(CountingPublisher {
        calls: AtomicUsize::new(0),
        fail_first: 1,
    });
    let mut worker = PlatformWorker::new(Platform::Twitter, publisher.clone())
        .with_retries(2, Duration::from_millis(1));
    assert!(matches!(
        worker.handle(message(Platform::Twitter, Uuid::new_v4())).await,
        Delivery::Published(_)
    ));

    let always_failing = Arc::new(CountingPublisher {
        calls: AtomicUsize::new(0),
        fail_first: usize::MAX,
    });
    let mut worker = PlatformWorker::new(Platform::Twitter, always_failing.clone())
        .with_retries(3, Duration::from_millis(1));
    let id = Uuid::new_v4();
    assert_eq!(worker.handle(message(Platform::Twitter, id)).await, Delivery::Failed);
    assert_eq!(always_failing.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn webhook_publisher_posts_message_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/linkedin"))
        .and(body_partial_json(serde_json::json!({
            "queue": "linkedin-post-link",
            "text": "New post: Hello https://ex.com"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "urn:li:share:1"})))
        .expect(1)
        .mount(&server)
        .await;

    let publisher = WebhookPublisher::new(Client::new(), format!("{}/hooks/linkedin", server.uri()));
    let id = publisher
        .publish(&message(Platform::LinkedIn, Uuid::new_v4()))
        .await
        .unwrap();
    assert_eq!(id, "urn:li:share:1");
}

#[tokio::test]
async fn webhook_rejection_is_a_publish_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(422).set_body_string("duplicate status"))
        .mount(&server)
        .await;

    let publisher = WebhookPublisher::new(Client::new(), server.uri());
    let err = publisher
        .publish(&message(Platform::Facebook, Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::Rejected(reason) if reason.contains("duplicate status")));
}

#[tokio::test]
async fn spawned_workers_drain_queues_until_stopped() {
    let publisher = Arc::new(CountingPublisher::default());
    let (queue, receivers) = ChannelQueue::new([Platform::Twitter, Platform::Bluesky], 4);
    let workers = vec![PlatformWorker::new(Platform::Twitter, publisher.clone())];
    let handle = spawn_platform_workers(workers, receivers);

    let id = Uuid::new_v4();
    queue.enqueue(message(Platform::Twitter, id)).await.unwrap();
    queue.enqueue(message(Platform::Twitter, id)).await.unwrap();
    // No publisher for Bluesky: the message is drained, not left to block.
    queue.enqueue(message(Platform::Bluesky, id)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while publisher.calls.load(Ordering::SeqCst) < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.stop().await.unwrap();
    assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
}
