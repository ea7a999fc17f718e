use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use ntrip_proxy::config::ConfigStore;
use ntrip_proxy::listener::Listener;
use ntrip_proxy::nmea_log;
use ntrip_proxy::registry::{ConnectionRegistry, DEFAULT_RETENTION, DEFAULT_SWEEP_INTERVAL};
use tracing::{debug, error, info, level_filters::LevelFilter};
use tracing_subscriber::{fmt::Subscriber as FmtSubscriber, EnvFilter};

/// Location-aware NTRIP proxy
#[derive(Clone, PartialEq, Debug, Parser)]
struct Args {
    /// Path to the JSON configuration file
    #[clap(long, default_value = "ntrip-proxy.json")]
    config: PathBuf,

    /// Path to the newline-delimited NMEA log
    #[clap(long, default_value = "nmea.log")]
    nmea_log: PathBuf,

    /// Interval, in seconds, between config file reload checks
    #[clap(long, default_value_t = 5)]
    config_poll_secs: u64,

    #[clap(long, default_value = "info")]
    /// Set log level
    log_level: LevelFilter,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    let filter = EnvFilter::from_default_env().add_directive(args.log_level.into());
    let _ = FmtSubscriber::builder()
        .compact()
        .with_env_filter(filter)
        .try_init();

    info!("Starting NTRIP proxy");
    debug!("Args {args:?}");

    let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel(1);

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("received Ctrl-C, shutting down...");
            let _ = signal_tx.send(());
        }
    });

    let config_store = Arc::new(ConfigStore::load(&args.config).await.map_err(|e| {
        error!("fatal: could not load config: {}", e);
        e
    })?);

    tokio::spawn(
        config_store
            .clone()
            .run_poll_loop(std::time::Duration::from_secs(args.config_poll_secs), shutdown_tx.subscribe()),
    );

    let registry = Arc::new(ConnectionRegistry::with_retention(DEFAULT_RETENTION));
    tokio::spawn(
        registry
            .clone()
            .run_sweep_loop(DEFAULT_SWEEP_INTERVAL, shutdown_tx.subscribe()),
    );

    let nmea_log = nmea_log::spawn_writer(args.nmea_log.clone(), shutdown_tx.subscribe());

    let listener = Listener::new(config_store, registry, nmea_log, shutdown_tx.clone());
    listener.run().await?;

    info!("NTRIP proxy exiting");
    Ok(())
}
