//! kiosk_api - HTTP front end for the kiosk analyzer
//!
//! This daemon:
//! 1. Loads and validates the kiosk configuration (fails fast)
//! 2. Opens the profile database
//! 3. Serves /health, /analyze and /sessions/{id}/profile until Ctrl-C

use anyhow::{anyhow, Result};
use std::sync::mpsc;

use kiosk_vision::{
    api::{ApiConfig, ApiServer},
    KioskConfig,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = KioskConfig::load()?;
    let api_handle = ApiServer::new(ApiConfig::from_kiosk(&config), config.clone()).spawn()?;
    if let Some(path) = &api_handle.token_path {
        log::info!("kiosk api capability token written to {}", path.display());
    } else {
        log::warn!(
            "kiosk api capability token (handle securely): {}",
            api_handle.token
        );
    }
    log::info!(
        "kiosk_api running on {} ({:?} mode, {} ms budget), profiles in {}",
        api_handle.addr,
        config.analyzer.runtime.mode,
        config.analyzer.runtime.heuristic_budget_ms,
        config.db_path
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|err| anyhow!("error setting Ctrl-C handler: {}", err))?;

    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
