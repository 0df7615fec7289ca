use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use mcu_bridge::{BridgeConfig, Dispatcher};

/// Discovery and connection scheduler for serial-attached microcontrollers.
#[derive(Debug, Parser)]
#[command(name = "mcu-bridge", version)]
struct Args {
    /// Baud rate used for newly discovered devices
    #[arg(long)]
    baud: Option<u32>,

    /// Maximum number of status records kept in memory
    #[arg(long)]
    history_capacity: Option<usize>,

    /// Per-exchange response timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Interval between discovery scans in milliseconds
    #[arg(long)]
    scan_interval_ms: Option<u64>,

    /// Directory scanned for serial device entries
    #[arg(long)]
    dev_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn into_config(self) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        if let Some(baud) = self.baud {
            config.baud_rate = baud;
        }
        if let Some(capacity) = self.history_capacity {
            config.history_capacity = capacity;
        }
        if let Some(timeout) = self.timeout_ms {
            config.response_timeout_ms = timeout;
        }
        if let Some(interval) = self.scan_interval_ms {
            config.scan_interval_ms = interval;
        }
        if let Some(dir) = self.dev_dir {
            config.dev_dir = dir;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = if args.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    env_logger::Builder::new().filter_level(level).parse_default_env().init();

    let config = args.into_config();
    config.validate().context("invalid configuration")?;
    log::debug!("Configuration: {}", serde_json::to_string(&config)?);

    let dispatcher = Dispatcher::new(config);
    log::info!("Microcontroller bridge started");

    let mut ticker = tokio::time::interval(dispatcher.config().scan_interval());
    loop {
        tokio::select! {
            _ = ticker.tick() => scan_once(&dispatcher).await,
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for shutdown signal")?;
                break;
            }
        }
    }

    log::info!("Shutting down, closing all links");
    dispatcher.shutdown().await;
    Ok(())
}

async fn scan_once(dispatcher: &Dispatcher) {
    for id in dispatcher.reap_faulted().await {
        log::info!("{} needs rediscovery", id);
    }

    if dispatcher.discover_devices().await.is_empty() && dispatcher.devices().await.is_empty() {
        log::info!(
            "No microcontrollers found. Scan will be retried after a short waiting period..."
        );
        return;
    }

    for (id, result) in dispatcher.connect_all().await {
        if let Err(e) = result {
            log::warn!("Failed to connect to {}, will rescan: {}", id, e);
        }
    }
}
