// =============================================================================
// Supervisor — wires the universe, shards, writer, books, and watchdog
// =============================================================================
//
// Startup order: store (pool + schema), registry preload, universe
// resolution against exchangeInfo, shard planning per channel class, then
// one worker + ingest task pair per shard. Shutdown reverses it: signal all
// tasks, give ingest tasks a bounded grace window to flush, close the pool.
//
// A single failed shard never takes the process down; only initialization
// errors are fatal.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api;
use crate::binance::FuturesRest;
use crate::buffer::{BufferLimits, Keyed, ShardBuffers};
use crate::config::Config;
use crate::db::watchdog::Watchdog;
use crate::db::{connect_pool, schema, BatchWriter};
use crate::metrics::Metrics;
use crate::orderbook::TopNBuilder;
use crate::registry::SymbolRegistry;
use crate::stream::worker::StreamWorker;
use crate::stream::{planner, ShardConfig};
use crate::types::{ChannelKind, MarketEvent, Table};

/// Events in flight between a worker and its ingest task. The bound is what
/// converts buffer saturation into backpressure on the WebSocket read loop.
const INGEST_CHANNEL_CAPACITY: usize = 10_000;

/// How long ingest tasks get to flush their buffers at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Depth defaults to the first N universe symbols when no override is set.
const DEFAULT_DEPTH_SYMBOLS: usize = 10;

/// Run the collector until a shutdown signal arrives. Returns the process
/// exit code: 0 for SIGTERM, 130 for SIGINT.
pub async fn run(config: Config) -> Result<i32> {
    let metrics = Arc::new(Metrics::new());
    let rest = FuturesRest::new(&config.base_url);

    // --- Store ------------------------------------------------------------
    let (pool, writer, registry) = if config.dry_run {
        info!("DRY_RUN active: persistence disabled, writes become no-ops");
        (
            None,
            Arc::new(BatchWriter::dry_run(metrics.clone())),
            Arc::new(SymbolRegistry::dry_run()),
        )
    } else {
        let pool = connect_pool(&config).await?;
        schema::ensure_schema(&pool).await?;
        let registry = SymbolRegistry::new(pool.clone());
        registry.preload().await?;
        (
            Some(pool.clone()),
            Arc::new(BatchWriter::new(pool, metrics.clone())),
            Arc::new(registry),
        )
    };

    // --- Universe ---------------------------------------------------------
    let universe = resolve_universe(&config, &rest).await?;
    let first_symbol = universe.first().cloned().unwrap_or_default();
    info!(
        symbols = universe.len(),
        first = %first_symbol,
        "symbol universe resolved"
    );

    let books = Arc::new(TopNBuilder::new(rest.clone(), metrics.clone()));
    let limits = BufferLimits::new(config.batch_size, config.flush_interval_secs);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // --- Shard plans per channel class -------------------------------------
    let mut plans: Vec<(&'static str, Vec<ShardConfig>)> = Vec::new();
    let mut next_shard_id = 0;

    let main_shards = planner::plan(&universe, &config.channels, config.shards, next_shard_id);
    next_shard_id += main_shards.len();
    plans.push(("main", main_shards));

    if config.enable_depth {
        let depth_symbols = depth_universe(&config, &universe);
        if depth_symbols.is_empty() {
            warn!("ENABLE_DEPTH set but the depth symbol list is empty, depth not started");
        } else {
            // One or two depth connections are plenty at @100ms rates.
            let depth_shard_count = (depth_symbols.len() / 5).clamp(1, 2);
            let depth_shards = planner::plan(
                &depth_symbols,
                &[ChannelKind::Depth],
                depth_shard_count,
                next_shard_id,
            );
            next_shard_id += depth_shards.len();
            info!(symbols = depth_symbols.len(), shards = depth_shards.len(), "depth enabled");
            plans.push(("depth", depth_shards));
        }
    }

    if config.enable_mark_price {
        let mark_shards = planner::plan(
            &universe,
            &[ChannelKind::MarkPrice],
            config.shards,
            next_shard_id,
        );
        next_shard_id += mark_shards.len();
        plans.push(("mark", mark_shards));
    }

    if config.enable_force_order {
        let force_shards = planner::plan(
            &universe,
            &[ChannelKind::ForceOrder],
            config.shards,
            next_shard_id,
        );
        plans.push(("force", force_shards));
    }

    // --- Spawn shard pipelines ---------------------------------------------
    let mut ingest_handles: Vec<JoinHandle<()>> = Vec::new();
    let mut total_shards = 0;

    for (group, shards) in plans {
        for shard in shards {
            total_shards += 1;
            let label = format!("{group}-{}", shard.shard_id);
            let shard_metrics =
                metrics.register_shard(shard.shard_id, label.clone(), shard.symbols.len());

            let (tx, rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);

            let worker = StreamWorker::new(
                shard,
                config.ws_url.clone(),
                tx,
                shutdown_rx.clone(),
                shard_metrics,
            );
            tokio::spawn(worker.run());

            ingest_handles.push(tokio::spawn(ingest_loop(
                label,
                rx,
                limits,
                writer.clone(),
                registry.clone(),
                books.clone(),
                shutdown_rx.clone(),
            )));
        }
    }
    info!(shards = total_shards, "shard pipelines launched");

    // --- Watchdog and status server ----------------------------------------
    if let Some(pool) = pool.clone() {
        if config.enable_db_watchdog {
            let watchdog = Watchdog::new(
                pool,
                metrics.clone(),
                config.db_watchdog_interval_secs,
                config.db_watchdog_threshold_secs,
            );
            tokio::spawn(watchdog.run(shutdown_rx.clone()));
        }
    }

    {
        let metrics = metrics.clone();
        let port = config.monitoring_port;
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(metrics, port, shutdown_rx).await {
                error!(error = %e, "status server exited");
            }
        });
    }

    info!("all subsystems running, waiting for shutdown signal");

    // --- Shutdown -----------------------------------------------------------
    let exit_code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("SIGINT received, shutting down");
            130
        }
        _ = sigterm() => {
            warn!("SIGTERM received, shutting down");
            0
        }
    };

    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(
        SHUTDOWN_GRACE,
        futures_util::future::join_all(ingest_handles),
    )
    .await
    {
        Ok(_) => info!("all ingest buffers flushed"),
        Err(_) => warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "shutdown grace window elapsed before every buffer flushed"
        ),
    }

    if let Some(pool) = pool {
        pool.close().await;
    }

    info!("collector shut down");
    Ok(exit_code)
}

async fn sigterm() {
    #[cfg(unix)]
    {
        let mut stream = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        stream.recv().await;
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}

// =============================================================================
// Universe resolution
// =============================================================================

/// Filter the configured candidates against the exchange's live instrument
/// list, then apply rotation and cap. REST failure falls back to the
/// configured list unfiltered.
async fn resolve_universe(config: &Config, rest: &FuturesRest) -> Result<Vec<String>> {
    let candidates = config.symbols.clone();

    let filtered = match rest.tradable_usdt_symbols().await {
        Ok(allowed) => {
            let filtered: Vec<String> = candidates
                .iter()
                .filter(|s| allowed.contains(*s))
                .cloned()
                .collect();
            let missing = candidates.len() - filtered.len();
            if missing > 0 {
                warn!(missing, "symbols not tradable on the futures exchange, filtered out");
            }
            filtered
        }
        Err(e) => {
            warn!(error = %e, "exchangeInfo unavailable, using configured list unfiltered");
            candidates
        }
    };

    let universe = config.rotate_universe(filtered);
    if universe.is_empty() {
        bail!("symbol universe resolved to an empty list");
    }
    Ok(universe)
}

fn depth_universe(config: &Config, universe: &[String]) -> Vec<String> {
    if !config.depth_top_symbols.is_empty() {
        return config
            .depth_top_symbols
            .iter()
            .filter(|s| universe.contains(s))
            .cloned()
            .collect();
    }
    universe
        .iter()
        .take(DEFAULT_DEPTH_SYMBOLS)
        .cloned()
        .collect()
}

// =============================================================================
// Ingest task: route events into buffers, flush on trigger, drain on stop
// =============================================================================

async fn ingest_loop(
    label: String,
    mut rx: mpsc::Receiver<MarketEvent>,
    limits: BufferLimits,
    writer: Arc<BatchWriter>,
    registry: Arc<SymbolRegistry>,
    books: Arc<TopNBuilder>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buffers = ShardBuffers::new(&limits);
    // Age triggers are checked between events too, so quiet shards still
    // flush on time.
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let ready = buffers.ready_tables();
                flush_tables(&mut buffers, &writer, &ready).await;
            }
            event = rx.recv() => {
                let Some(event) = event else { break };
                ingest_event(&mut buffers, &registry, &books, event).await;
                let ready = buffers.ready_tables();
                flush_tables(&mut buffers, &writer, &ready).await;
            }
        }
    }

    // Capture frames decoded before the worker observed the signal.
    while let Ok(event) = rx.try_recv() {
        ingest_event(&mut buffers, &registry, &books, event).await;
    }

    let remaining = buffers.non_empty_tables();
    flush_tables(&mut buffers, &writer, &remaining).await;
    info!(shard = %label, "ingest task drained");
}

async fn ingest_event(
    buffers: &mut ShardBuffers,
    registry: &SymbolRegistry,
    books: &TopNBuilder,
    event: MarketEvent,
) {
    let symbol_id = match registry.resolve(event.symbol()).await {
        Ok(id) => id,
        Err(e) => {
            warn!(symbol = %event.symbol(), error = %e, "symbol resolution failed, event dropped");
            return;
        }
    };

    match event {
        MarketEvent::BookTicker(e) => buffers.book_ticker.push(Keyed { symbol_id, event: e }),
        MarketEvent::Trade(e) => buffers.trades.push(Keyed { symbol_id, event: e }),
        MarketEvent::DepthDiff(e) => {
            if let Some(record) = books.process_event(&e, symbol_id).await {
                buffers.orderbook_top5.push(record);
            }
            buffers.depth_events.push(Keyed { symbol_id, event: e });
        }
        MarketEvent::MarkPrice(e) => buffers.mark_price.push(Keyed { symbol_id, event: e }),
        MarketEvent::ForceOrder(e) => buffers.force_orders.push(Keyed { symbol_id, event: e }),
    }
}

async fn flush_tables(buffers: &mut ShardBuffers, writer: &BatchWriter, tables: &[Table]) {
    for table in tables {
        match table {
            Table::BookTicker => writer.insert_book_ticker(buffers.book_ticker.drain()).await,
            Table::Trades => writer.insert_trades(buffers.trades.drain()).await,
            Table::DepthEvents => writer.insert_depth(buffers.depth_events.drain()).await,
            Table::OrderbookTop5 => writer.insert_top5(buffers.orderbook_top5.drain()).await,
            Table::MarkPrice => writer.insert_mark(buffers.mark_price.drain()).await,
            Table::ForceOrders => writer.insert_force(buffers.force_orders.drain()).await,
        }
    }
}
