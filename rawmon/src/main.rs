use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use rawmon::clients::{
    CisClient, JobStore, LocalStorage, MetadataService, MsConvert, RcloneStorage, StasisClient,
    Storage,
};
use rawmon::config::{AppConfig, DEFAULT_CONFIG_FILE, StorageBackend};
use rawmon::logging::{DEBUG_LOG_FILTER, init_logging};
use rawmon::pipeline::{Collaborators, PipelineSupervisor};
use rawmon::queue::open_queue_service;

#[derive(Parser, Debug)]
#[command(name = "rawmon")]
#[command(version)]
#[command(about = "Converts, archives and schedules raw instrument data as it is acquired")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE, env = "RAWMON_CONFIG")]
    config: PathBuf,

    /// Use the test queues and the short stability interval
    #[arg(long)]
    test: bool,

    /// Log at debug level
    #[arg(long)]
    debug: bool,

    /// Validate the configuration and the conversion tool, then exit
    #[arg(long)]
    check: bool,
}

fn build_storage(config: &AppConfig) -> Arc<dyn Storage> {
    match config.storage.backend {
        StorageBackend::Local => Arc::new(LocalStorage::new(&config.storage.root)),
        StorageBackend::Rclone => Arc::new(RcloneStorage::new(
            &config.storage.rclone_path,
            &config.storage.remote,
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // API keys may come from a .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let mut config = AppConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if cli.test {
        config.enable_test_mode();
    }
    config.validate()?;

    let (logging, _guard) = init_logging(&config.logging.dir, config.logging.filter.as_deref())?;
    if cli.debug {
        logging.set_filter(DEBUG_LOG_FILTER)?;
    }

    info!("Starting rawmon v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {}", cli.config.display());

    let converter = MsConvert::new(&config.monitor.msconvert);
    converter.check()?;

    if cli.check {
        info!("Configuration is valid");
        return Ok(());
    }

    let tracker = Arc::new(StasisClient::new(&config.tracker)?);
    let (metadata, jobs) = if config.monitor.schedule {
        let metadata: Arc<dyn MetadataService> = Arc::new(CisClient::new(&config.metadata)?);
        let jobs: Arc<dyn JobStore> = tracker.clone();
        (Some(metadata), Some(jobs))
    } else {
        (None, None)
    };

    let collaborators = Collaborators {
        tracker,
        storage: build_storage(&config),
        converter: Arc::new(converter),
        metadata,
        jobs,
    };

    let queue = open_queue_service(&config.queue)
        .await
        .context("queue backend is unavailable")?;

    let supervisor = PipelineSupervisor::start(&config, queue, collaborators).await?;
    logging.start_retention_cleanup(supervisor.cancellation_token());

    supervisor.run_until_shutdown().await?;
    info!("rawmon stopped");
    Ok(())
}
