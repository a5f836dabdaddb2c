use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use relay_core::readers::build_reader;
use relay_core::telemetry::ensure_metrics_described;
use relay_core::{
    spawn_platform_workers, spawn_rotation, spawn_scheduler, AppConfig, ChannelQueue,
    ConfiguredSource, Event, JsonStore, LocalSecretStore, OAuthRefreshProvider, Platform,
    PlatformWorker, PollConfig, Repositories, RotationManager, Scheduler, TokenRegistry,
    WebhookPublisher,
};
use reqwest::{redirect, Client, ClientBuilder};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();

    let config = AppConfig::load()?;
    let data_dir = config.data_dir()?;
    info!(data_dir = %data_dir.display(), sources = config.sources.len(), "starting relay");

    if let Some(listen) = &config.metrics_listen {
        install_metrics_exporter(listen)?;
    }
    ensure_metrics_described();

    let client = ClientBuilder::new()
        .redirect(redirect::Policy::limited(5))
        .user_agent("relay/0.1")
        .timeout(Duration::from_secs(config.poll.request_timeout_seconds.max(1)))
        .build()?;

    let store = Arc::new(JsonStore::load_from(data_dir.join("relay.json")).await?);
    let secrets = Arc::new(LocalSecretStore::load_from(data_dir.join("secrets.json")).await?);

    let (queue, receivers) = ChannelQueue::new(Platform::ALL, config.dispatch.queue_capacity);
    let workers = build_workers(&config, &client);
    let workers_handle = spawn_platform_workers(workers, receivers);

    let (events_tx, events_rx) = mpsc::channel(256);
    let scheduler = Scheduler {
        sources: build_sources(&config, &client),
        repos: Repositories::from_store(store.clone()),
        queue: Arc::new(queue),
        dispatch: config.dispatch.to_dispatch_config(),
        random_post: Some(config.random_post.clone()),
    };
    let scheduler_handle = spawn_scheduler(scheduler, PollConfig::from(&config.poll), events_tx.clone());

    let rotation_handle = if config.tokens.is_empty() {
        None
    } else {
        let manager = RotationManager::new(
            build_registry(&config, &client),
            secrets,
            store.clone(),
            config.rotation.to_rotation_config(),
        );
        let interval = Duration::from_secs(config.rotation.interval_minutes.max(1) * 60);
        Some(spawn_rotation(manager, interval, events_tx))
    };

    let log_events = tokio::spawn(log_events(events_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    scheduler_handle.stop().await?;
    if let Some(handle) = rotation_handle {
        handle.stop().await?;
    }
    workers_handle.stop().await?;
    log_events.abort();
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn install_metrics_exporter(listen: &str) -> Result<(), Box<dyn Error>> {
    let addr: SocketAddr = listen.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!(%addr, "prometheus exporter listening");
    Ok(())
}

fn build_sources(config: &AppConfig, client: &Client) -> Vec<ConfiguredSource> {
    config
        .sources
        .iter()
        .map(|source| ConfiguredSource {
            name: source.name.clone(),
            reader: build_reader(source, client.clone()),
            policy: source.schedule.build(),
            platforms: source.platforms.clone(),
        })
        .collect()
}

fn build_workers(config: &AppConfig, client: &Client) -> Vec<PlatformWorker> {
    config
        .publishers
        .iter()
        .map(|publisher| {
            let webhook = WebhookPublisher::new(client.clone(), publisher.webhook_url.clone())
                .with_timeout(Duration::from_secs(publisher.timeout_seconds.max(1)));
            PlatformWorker::new(publisher.platform, Arc::new(webhook))
        })
        .collect()
}

fn build_registry(config: &AppConfig, client: &Client) -> TokenRegistry {
    config.tokens.iter().fold(TokenRegistry::new(), |registry, token| {
        let provider = OAuthRefreshProvider::new(
            client.clone(),
            token.token_url.clone(),
            token.client_id.clone(),
            token.client_secret.clone(),
            token.refresh_token.clone(),
        );
        registry.register(token.token, token.secret_name.clone(), Arc::new(provider))
    })
}

async fn log_events(mut events: mpsc::Receiver<Event>) {
    while let Some(event) = events.recv().await {
        match event {
            Event::Ingested(report) if report.inserted + report.updated > 0 => {
                info!(source = %report.source, inserted = report.inserted, updated = report.updated, scheduled = report.scheduled, "new items ingested");
            }
            Event::Ingested(_) => {}
            Event::SourceFailed { source, error } => {
                warn!(source = %source, error = %error, "source poll failed");
            }
            Event::Dispatched(report) => {
                info!(fired = report.fired, failed = report.failed, parked = report.parked, stuck = report.stuck, "items fired");
            }
            Event::RandomPostScheduled(item) => {
                info!(id = %item.id, send_on = %item.send_on_date_time, "random post scheduled");
            }
            Event::TokenRotated { token, outcome } => {
                info!(token = %token, outcome = ?outcome, "token checked");
            }
            Event::RotationFailed { token, error } => {
                error!(token = %token, error = %error, "token rotation failed");
            }
        }
    }
}
