pub mod checkpoint;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod feed;
pub mod ingest;
pub mod message;
pub mod poller;
pub mod publish;
pub mod queue;
pub mod random;
pub mod readers;
pub mod rotation;
pub mod schedule;
pub mod source;
pub mod storage;
pub mod store;
pub mod telemetry;

pub use checkpoint::Checkpoint;
pub use config::{AppConfig, SourceConfig, SourceKind};
pub use dispatch::{dispatch_due, DispatchConfig, DispatchReport};
pub use error::{
    ConfigError, IdentityError, IngestError, PollError, PublishError, QueueError, RotationError,
    SecretStoreError, SourceError, StoreError,
};
pub use ingest::{poll_source, schedule_random_post, ConfiguredSource, PollReport, RandomPostPlan, Repositories};
pub use poller::{
    poll_once, spawn_platform_workers, spawn_rotation, spawn_scheduler, Event, PollConfig,
    PollerHandle, Scheduler,
};
pub use publish::{Delivery, PlatformWorker, Publisher, WebhookPublisher};
pub use queue::{ChannelQueue, Platform, PlatformQueue, QueueMessage};
pub use rotation::{
    LocalSecretStore, OAuthRefreshProvider, RotationConfig, RotationManager, RotationOutcome,
    SecretStore, TokenRefreshInfo, TokenRegistry, TokenType,
};
pub use schedule::{OriginKey, RetryPolicy, ScheduledItem, SourceTable};
pub use source::{SourceData, SourceSystem};
pub use storage::JsonStore;
