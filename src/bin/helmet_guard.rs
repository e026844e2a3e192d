//! helmet-guard - helmet compliance monitor daemon
//!
//! This daemon:
//! 1. Loads the layered configuration (file + environment)
//! 2. Loads the detector and the alert notifier once
//! 3. Starts the capture/detect/notify pipeline on the configured source
//! 4. Serves the JSON control surface until Ctrl-C

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use helmet_guard::{
    api::{ApiConfig, ApiServer},
    AppConfig, Monitor, SourceConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON or TOML config file.
    #[arg(long, env = "HELMET_CONFIG")]
    config: Option<PathBuf>,
    /// Control API listen address (overrides config and environment).
    #[arg(long)]
    addr: Option<String>,
    /// Initial source, e.g. `device:0` or `file:media/site.mp4`.
    #[arg(long)]
    source: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = AppConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }
    if let Some(source) = args.source {
        config.source =
            SourceConfig::parse(&source).map_err(|err| anyhow!("--source is invalid: {err}"))?;
    }
    match &config.config_path {
        Some(path) => log::info!("configuration loaded from {}", path.display()),
        None => log::info!("no config file; using defaults and environment"),
    }

    let monitor = Arc::new(Monitor::from_config(&config).context("initialize monitor")?);
    // A source that cannot be opened is logged; the operator can pick another one.
    if let Err(err) = monitor.start() {
        log::error!("pipeline not started: {}", err);
    }

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, Arc::clone(&monitor)).spawn()?;
    log::info!(
        "helmet-guard running. source={}, target class={}, control api on {}",
        monitor.active_source(),
        monitor.settings().target_class,
        api_handle.addr
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|err| anyhow!("error setting Ctrl-C handler: {err}"))?;

    log::info!("waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    monitor.shutdown();
    api_handle.stop()?;

    Ok(())
}
