use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::PublishError;
use crate::queue::{Platform, QueueMessage};

/// Posts a rendered message to a platform and returns the platform's id for
/// the post.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: &QueueMessage) -> Result<String, PublishError>;
}

/// Forwards queue messages as JSON to a webhook, one per platform.
#[derive(Debug, Clone)]
pub struct WebhookPublisher {
    client: Client,
    url: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct WebhookResponse {
    #[serde(default)]
    id: Option<String>,
}

impl WebhookPublisher {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn publish(&self, message: &QueueMessage) -> Result<String, PublishError> {
        let body = serde_json::json!({
            "scheduled_item_id": message.scheduled_item_id,
            "queue": message.platform.queue_name(),
            "text": message.message,
            "source_table": message.source_table,
            "source_primary_key": message.source_primary_key,
            "source_secondary_key": message.source_secondary_key,
        });
        let resp = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(PublishError::Rejected(format!("{status}: {}", text.trim())));
        }
        let bytes = resp.bytes().await?;
        let id = serde_json::from_slice::<WebhookResponse>(&bytes)
            .ok()
            .and_then(|r| r.id)
            .unwrap_or_else(|| message.scheduled_item_id.to_string());
        Ok(id)
    }
}

/// Ids this worker has already published, oldest evicted first.
#[derive(Debug, Default)]
struct Delivered {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl Delivered {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ..Self::default()
        }
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: Uuid) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Published(String),
    /// Already published by this worker; the queue redelivered it.
    Duplicate,
    Failed,
}

/// Consumes one platform queue. Deliveries are at-least-once, so messages
/// are deduplicated on the scheduled item id.
pub struct PlatformWorker {
    platform: Platform,
    publisher: Arc<dyn Publisher>,
    delivered: Delivered,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl PlatformWorker {
    pub fn new(platform: Platform, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            platform,
            publisher,
            delivered: Delivered::with_capacity(10_000),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(2),
        }
    }

    pub fn with_retries(mut self, max_attempts: u32, retry_backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub async fn handle(&mut self, message: QueueMessage) -> Delivery {
        let id = message.scheduled_item_id;
        if self.delivered.contains(&id) {
            debug!(queue = self.platform.queue_name(), id = %id, "duplicate delivery ignored");
            return Delivery::Duplicate;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.publisher.publish(&message).await {
                Ok(post_id) => {
                    self.delivered.insert(id);
                    info!(queue = self.platform.queue_name(), id = %id, post_id = %post_id, "published");
                    return Delivery::Published(post_id);
                }
                Err(err) if attempt < self.max_attempts => {
                    warn!(queue = self.platform.queue_name(), id = %id, attempt, error = %err, "publish failed, retrying");
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(err) => {
                    error!(queue = self.platform.queue_name(), id = %id, attempts = attempt, error = %err, "publish failed; giving up");
                    return Delivery::Failed;
                }
            }
        }
    }

    /// Drain the queue until it closes or a cancel signal arrives.
    pub async fn run(
        mut self,
        mut queue: mpsc::Receiver<QueueMessage>,
        mut cancel: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = cancel.recv() => {
                    debug!(queue = self.platform.queue_name(), "platform worker cancelled");
                    break;
                }
                next = queue.recv() => match next {
                    Some(message) => {
                        self.handle(message).await;
                    }
                    None => {
                        debug!(queue = self.platform.queue_name(), "platform queue closed");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivered_set_evicts_oldest() {
        let mut delivered = Delivered::with_capacity(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        delivered.insert(a);
        delivered.insert(b);
        delivered.insert(c);
        assert!(!delivered.contains(&a));
        assert!(delivered.contains(&b));
        assert!(delivered.contains(&c));
    }
}
