// =============================================================================
// Helios Futures Collector — Main Entry Point
// =============================================================================
//
// Ingests Binance USDT-perp market data over sharded WebSocket connections,
// persists raw events into TimescaleDB, and reconstructs a top-5 order book
// with microstructure features on every applied depth diff.
//
// Exit codes: 0 clean shutdown (SIGTERM), 1 initialization failure,
// 130 signal-interrupted shutdown (SIGINT).
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod binance;
mod buffer;
mod config;
mod db;
mod metrics;
mod orderbook;
mod registry;
mod stream;
mod supervisor;
mod types;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Helios Futures Collector — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(1);
        }
    };

    info!(
        symbols = config.symbols.len(),
        channels = ?config.channels,
        shards = config.shards,
        depth = config.enable_depth,
        mark_price = config.enable_mark_price,
        force_order = config.enable_force_order,
        dry_run = config.dry_run,
        "configuration loaded"
    );

    match supervisor::run(config).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(error = %e, "initialization failed");
            std::process::exit(1);
        }
    }
}
