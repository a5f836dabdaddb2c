use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::QueueError;
use crate::schedule::{ScheduledItem, SourceTable};

/// Destination social platform. Each one has its own work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Platform {
    Twitter,
    Bluesky,
    Facebook,
    LinkedIn,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Twitter,
        Platform::Bluesky,
        Platform::Facebook,
        Platform::LinkedIn,
    ];

    pub fn queue_name(self) -> &'static str {
        match self {
            Platform::Twitter => "twitter-tweets-to-send",
            Platform::Bluesky => "bluesky-posts-to-send",
            Platform::Facebook => "facebook-post-status-to-page",
            Platform::LinkedIn => "linkedin-post-link",
        }
    }
}

/// Payload placed on a platform queue when a scheduled item fires.
///
/// Delivery is at-least-once: consumers must deduplicate on
/// `scheduled_item_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueMessage {
    pub scheduled_item_id: Uuid,
    pub platform: Platform,
    pub message: String,
    pub source_table: SourceTable,
    pub source_primary_key: String,
    pub source_secondary_key: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn for_item(item: &ScheduledItem, platform: Platform, now: DateTime<Utc>) -> Self {
        Self {
            scheduled_item_id: item.id,
            platform,
            message: item.message.clone(),
            source_table: item.source_table,
            source_primary_key: item.source_primary_key.clone(),
            source_secondary_key: item.source_secondary_key.clone(),
            enqueued_at: now,
        }
    }
}

#[async_trait]
pub trait PlatformQueue: Send + Sync {
    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError>;
}

/// In-process queues backed by bounded tokio channels, one per platform.
#[derive(Debug, Clone)]
pub struct ChannelQueue {
    senders: HashMap<Platform, mpsc::Sender<QueueMessage>>,
}

impl ChannelQueue {
    /// Create queues for `platforms`, returning the receiving halves for the
    /// platform workers.
    pub fn new(
        platforms: impl IntoIterator<Item = Platform>,
        capacity: usize,
    ) -> (Self, HashMap<Platform, mpsc::Receiver<QueueMessage>>) {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for platform in platforms {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            senders.insert(platform, tx);
            receivers.insert(platform, rx);
        }
        (Self { senders }, receivers)
    }
}

#[async_trait]
impl PlatformQueue for ChannelQueue {
    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError> {
        let platform = message.platform;
        let sender = self
            .senders
            .get(&platform)
            .ok_or(QueueError::NoRoute(platform))?;
        sender
            .send(message)
            .await
            .map_err(|_| QueueError::Closed(platform.queue_name()))
    }
}
