use std::path::Path;
use std::sync::Arc;

use grpc_discovery::services::config_store::DEFAULT_EVENT_CAPACITY;
use grpc_discovery::{AppConfig, ConfigEventKind, RegistryBootstrap};
use jemallocator::Jemalloc;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn load_config() -> Result<AppConfig, Box<dyn std::error::Error>> {
    let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    if Path::new(&path).exists() {
        Ok(AppConfig::load(&path)?)
    } else {
        Ok(AppConfig::from_env()?)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    let bootstrap = Arc::new(
        RegistryBootstrap::default().with_connection_config(config.connection.clone()),
    );
    let manager = bootstrap
        .try_get_or_init(&config.registry, &config.rpc)
        .await?;

    if let Some(coordinator) = manager.config() {
        let (events_tx, events_rx) = mpsc::channel(DEFAULT_EVENT_CAPACITY);
        for data_id in &config.watch_data_ids {
            let store = coordinator.new_store(data_id, events_tx.clone()).await;
            store.load().await;
        }
        drop(events_tx);

        tokio::spawn(async move {
            let mut events = ReceiverStream::new(events_rx);
            while let Some(event) = events.next().await {
                match event.kind {
                    ConfigEventKind::Errored => tracing::warn!(
                        data_id = %event.data_id,
                        group = %event.group,
                        error = ?event.error,
                        "{}", event.kind
                    ),
                    _ => tracing::info!(
                        data_id = %event.data_id,
                        group = %event.group,
                        bytes = event.content.len(),
                        "{}", event.kind
                    ),
                }
            }
        });
    } else if !config.watch_data_ids.is_empty() {
        tracing::warn!("watch_data_ids configured but config center is disabled");
    }

    tracing::info!("Registry client running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    bootstrap.shutdown().await;
    Ok(())
}
