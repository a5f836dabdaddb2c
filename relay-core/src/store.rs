//! Persistence seams for the records this crate owns.
//!
//! Every `save`/`update` is conditional on the caller's `expected_version`:
//! `None` means "must not exist yet", `Some(v)` means "must still be at
//! version `v`". A mismatch is reported as [`StoreError::Conflict`], which
//! callers treat as another writer having won.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::error::StoreError;
use crate::rotation::{TokenRefreshInfo, TokenType};
use crate::schedule::{OriginKey, ScheduledItem};
use crate::source::{SourceData, SourceSystem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// The source reported a newer update date; fields were replaced in place.
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Upserted {
    pub record: SourceData,
    pub outcome: UpsertOutcome,
}

#[async_trait]
pub trait SourceDataRepository: Send + Sync {
    /// Insert or update by `(source_system, identity)`. The stored `id` and
    /// `added_on` survive updates.
    async fn upsert(&self, item: SourceData) -> Result<Upserted, StoreError>;

    async fn get(
        &self,
        system: SourceSystem,
        identity: &str,
    ) -> Result<Option<SourceData>, StoreError>;

    async fn list(&self) -> Result<Vec<SourceData>, StoreError>;
}

#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    async fn get(&self, source_name: &str) -> Result<Option<Checkpoint>, StoreError>;

    async fn save(
        &self,
        checkpoint: Checkpoint,
        expected_version: Option<u64>,
    ) -> Result<Checkpoint, StoreError>;
}

#[async_trait]
pub trait ScheduledItemRepository: Send + Sync {
    /// Insert a pending record. Fails with a conflict if an unsent record
    /// already exists for the same origin key.
    async fn insert_pending(&self, item: ScheduledItem) -> Result<ScheduledItem, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<ScheduledItem>, StoreError>;

    /// Most recently created record for `origin`, sent or not.
    async fn latest_for_origin(
        &self,
        origin: &OriginKey,
    ) -> Result<Option<ScheduledItem>, StoreError>;

    /// Unsent records due at `now`, oldest `send_on_date_time` first.
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledItem>, StoreError>;

    async fn update(
        &self,
        item: ScheduledItem,
        expected_version: u64,
    ) -> Result<ScheduledItem, StoreError>;

    async fn list(&self) -> Result<Vec<ScheduledItem>, StoreError>;
}

#[async_trait]
pub trait TokenRefreshRepository: Send + Sync {
    async fn get(&self, token: TokenType) -> Result<Option<TokenRefreshInfo>, StoreError>;

    async fn save(
        &self,
        info: TokenRefreshInfo,
        expected_version: Option<u64>,
    ) -> Result<TokenRefreshInfo, StoreError>;
}
