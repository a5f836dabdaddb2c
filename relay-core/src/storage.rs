use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::error::StoreError;
use crate::rotation::{TokenRefreshInfo, TokenType};
use crate::schedule::{OriginKey, ScheduledItem};
use crate::source::{SourceData, SourceSystem};
use crate::store::{
    CheckpointRepository, ScheduledItemRepository, SourceDataRepository, TokenRefreshRepository,
    UpsertOutcome, Upserted,
};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StoreData {
    // "<system>/<identity>" -> item
    #[serde(default)]
    source_data: BTreeMap<String, SourceData>,
    // source name -> checkpoint
    #[serde(default)]
    checkpoints: BTreeMap<String, Checkpoint>,
    // scheduled item id -> record
    #[serde(default)]
    scheduled: BTreeMap<String, ScheduledItem>,
    // token type -> refresh state
    #[serde(default)]
    tokens: BTreeMap<String, TokenRefreshInfo>,
}

/// Single JSON document holding every record the relay owns.
///
/// Writes are applied to a copy, persisted (temp file + rename), and only
/// then made visible, so a failed write leaves both disk and memory as they
/// were. Without a path the store is memory-only.
#[derive(Debug, Clone)]
pub struct JsonStore {
    inner: Arc<RwLock<StoreData>>,
    path: Option<PathBuf>,
}

/// Read a JSON document, falling back to the `.json.tmp` sibling when the
/// main file is corrupt. A missing file yields the default. When neither
/// file parses the load fails and both are left on disk untouched.
pub(crate) async fn read_json_with_tmp_fallback<T: DeserializeOwned + Default>(
    path: &Path,
) -> Result<T, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(e.into()),
    };
    let main_err = match serde_json::from_slice::<T>(&bytes) {
        Ok(v) => return Ok(v),
        Err(e) => e,
    };
    warn!(error = %main_err, path = %path.display(), "failed to parse JSON, trying tmp fallback");
    let tmp = path.with_extension("json.tmp");
    let tmp_err = match tokio::fs::read(&tmp).await {
        Ok(tmp_bytes) => match serde_json::from_slice::<T>(&tmp_bytes) {
            Ok(v) => return Ok(v),
            Err(e) => e.to_string(),
        },
        Err(e) => e.to_string(),
    };
    error!(path = %path.display(), tmp_error = %tmp_err, "refusing to load corrupt document");
    Err(StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: main_err.to_string(),
    })
}

pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn check_version(
    entity: &'static str,
    key: &str,
    current: Option<u64>,
    expected: Option<u64>,
) -> Result<(), StoreError> {
    if current == expected {
        Ok(())
    } else {
        Err(StoreError::Conflict {
            entity,
            key: key.to_string(),
        })
    }
}

fn source_key(system: SourceSystem, identity: &str) -> String {
    format!("{}/{}", system.as_str(), identity)
}

impl JsonStore {
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreData::default())),
            path: None,
        }
    }

    /// Open the store at `path`. Fails instead of starting empty when the
    /// file exists but cannot be read back.
    pub async fn load_from(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let data: StoreData = read_json_with_tmp_fallback(&path).await?;
        Ok(Self {
            inner: Arc::new(RwLock::new(data)),
            path: Some(path),
        })
    }

    async fn commit<T>(
        &self,
        apply: impl FnOnce(&mut StoreData) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.inner.write().await;
        let mut next = guard.clone();
        let out = apply(&mut next)?;
        match &self.path {
            Some(path) => write_json_atomic(path, &next).await?,
            None => debug!("store is in-memory only; skipping persist"),
        }
        *guard = next;
        Ok(out)
    }
}

#[async_trait]
impl SourceDataRepository for JsonStore {
    async fn upsert(&self, item: SourceData) -> Result<Upserted, StoreError> {
        let key = source_key(item.source_system, &item.identity);
        self.commit(|data| {
            let (record, outcome) = match data.source_data.get(&key) {
                None => (item, UpsertOutcome::Inserted),
                Some(existing) if item.updated_on_date > existing.updated_on_date => {
                    let mut updated = item;
                    updated.id = existing.id;
                    updated.added_on = existing.added_on;
                    (updated, UpsertOutcome::Updated)
                }
                Some(existing) => {
                    return Ok(Upserted {
                        record: existing.clone(),
                        outcome: UpsertOutcome::Unchanged,
                    })
                }
            };
            data.source_data.insert(key, record.clone());
            Ok(Upserted { record, outcome })
        })
        .await
    }

    async fn get(
        &self,
        system: SourceSystem,
        identity: &str,
    ) -> Result<Option<SourceData>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.source_data.get(&source_key(system, identity)).cloned())
    }

    async fn list(&self) -> Result<Vec<SourceData>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.source_data.values().cloned().collect())
    }
}

#[async_trait]
impl CheckpointRepository for JsonStore {
    async fn get(&self, source_name: &str) -> Result<Option<Checkpoint>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.checkpoints.get(source_name).cloned())
    }

    async fn save(
        &self,
        mut checkpoint: Checkpoint,
        expected_version: Option<u64>,
    ) -> Result<Checkpoint, StoreError> {
        self.commit(|data| {
            let key = checkpoint.source_name.clone();
            let current = data.checkpoints.get(&key).map(|c| c.version);
            check_version("checkpoint", &key, current, expected_version)?;
            checkpoint.version = expected_version.map_or(1, |v| v + 1);
            data.checkpoints.insert(key, checkpoint.clone());
            Ok(checkpoint)
        })
        .await
    }
}

#[async_trait]
impl ScheduledItemRepository for JsonStore {
    async fn insert_pending(&self, mut item: ScheduledItem) -> Result<ScheduledItem, StoreError> {
        self.commit(|data| {
            let origin = item.origin();
            let already_pending = data
                .scheduled
                .values()
                .any(|existing| existing.is_pending() && existing.origin() == origin);
            if already_pending {
                return Err(StoreError::Conflict {
                    entity: "scheduled_item",
                    key: origin.to_string(),
                });
            }
            item.version = 1;
            data.scheduled.insert(item.id.to_string(), item.clone());
            Ok(item)
        })
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScheduledItem>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.scheduled.get(&id.to_string()).cloned())
    }

    async fn latest_for_origin(
        &self,
        origin: &OriginKey,
    ) -> Result<Option<ScheduledItem>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .scheduled
            .values()
            .filter(|item| item.origin() == *origin)
            .max_by_key(|item| item.created_on)
            .cloned())
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledItem>, StoreError> {
        let inner = self.inner.read().await;
        let mut due: Vec<ScheduledItem> = inner
            .scheduled
            .values()
            .filter(|item| item.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.send_on_date_time
                .cmp(&b.send_on_date_time)
                .then(a.created_on.cmp(&b.created_on))
        });
        Ok(due)
    }

    async fn update(
        &self,
        mut item: ScheduledItem,
        expected_version: u64,
    ) -> Result<ScheduledItem, StoreError> {
        self.commit(|data| {
            let key = item.id.to_string();
            let current = data.scheduled.get(&key).ok_or_else(|| StoreError::NotFound {
                entity: "scheduled_item",
                key: key.clone(),
            })?;
            // Sent records are an audit log; nothing may touch them again.
            if current.message_sent {
                return Err(StoreError::Conflict {
                    entity: "scheduled_item",
                    key,
                });
            }
            check_version("scheduled_item", &key, Some(current.version), Some(expected_version))?;
            item.version = expected_version + 1;
            data.scheduled.insert(key, item.clone());
            Ok(item)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<ScheduledItem>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.scheduled.values().cloned().collect())
    }
}

#[async_trait]
impl TokenRefreshRepository for JsonStore {
    async fn get(&self, token: TokenType) -> Result<Option<TokenRefreshInfo>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.tokens.get(token.as_str()).cloned())
    }

    async fn save(
        &self,
        mut info: TokenRefreshInfo,
        expected_version: Option<u64>,
    ) -> Result<TokenRefreshInfo, StoreError> {
        self.commit(|data| {
            let key = info.name.as_str();
            let current = data.tokens.get(key).map(|t| t.version);
            check_version("token_refresh_info", key, current, expected_version)?;
            info.version = expected_version.map_or(1, |v| v + 1);
            data.tokens.insert(key.to_string(), info.clone());
            Ok(info)
        })
        .await
    }
}
