use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{newer_than, SourceReader};
use crate::error::SourceError;
use crate::source::{SourceData, SourceSystem};

/// One speaking engagement as kept in the engagements file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Engagement {
    pub id: String,
    pub name: String,
    pub url: String,
    pub start_datetime: DateTime<Utc>,
    pub end_datetime: DateTime<Utc>,
    pub created_on: DateTime<Utc>,
    pub updated_on: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Engagement {
    /// Engagements stop surfacing once they are over.
    pub fn into_source_data(self, now: DateTime<Utc>) -> SourceData {
        let mut data = SourceData::new(
            SourceSystem::Engagement,
            self.id,
            self.name,
            self.url,
            self.created_on,
            now,
        );
        data.updated_on_date = self.updated_on.max(self.created_on);
        data.end_after = Some(self.end_datetime);
        data.tags = self.tags.into_iter().collect();
        data
    }
}

pub struct EngagementsReader {
    path: PathBuf,
}

impl EngagementsReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SourceReader for EngagementsReader {
    fn system(&self) -> SourceSystem {
        SourceSystem::Engagement
    }

    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<SourceData>, SourceError> {
        let bytes = tokio::fs::read(&self.path).await?;
        let engagements: Vec<Engagement> = serde_json::from_slice(&bytes)?;
        let now = Utc::now();
        let items = engagements
            .into_iter()
            .map(|e| e.into_source_data(now))
            .collect();
        Ok(newer_than(items, since))
    }
}
