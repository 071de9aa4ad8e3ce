// =============================================================================
// Schema Bootstrap — idempotent DDL for the marketdata schema
// =============================================================================
//
// Every statement is IF NOT EXISTS so redeploys are safe against a live
// database. Hypertable conversion is best-effort: without the TimescaleDB
// extension the collector runs against plain partially-indexed tables.
//
// Unique indexes double as the ON CONFLICT targets of the batch writer;
// hypertables require the partition column (ts_exchange) in every unique
// index, which is why the trades key carries it alongside agg_trade_id.
// =============================================================================

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{info, warn};

const DDL: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS marketdata",
    "CREATE TABLE IF NOT EXISTS marketdata.symbols (
        id          SERIAL PRIMARY KEY,
        exchange    TEXT NOT NULL,
        symbol      TEXT NOT NULL,
        base_asset  TEXT,
        quote_asset TEXT,
        is_active   BOOLEAN NOT NULL DEFAULT TRUE,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT uq_symbols_exchange_symbol UNIQUE (exchange, symbol)
    )",
    "CREATE TABLE IF NOT EXISTS marketdata.book_ticker (
        ts_exchange TIMESTAMPTZ NOT NULL,
        ts_ingest   TIMESTAMPTZ NOT NULL,
        symbol_id   INTEGER NOT NULL,
        update_id   BIGINT,
        best_bid    DOUBLE PRECISION NOT NULL,
        best_ask    DOUBLE PRECISION NOT NULL,
        bid_qty     DOUBLE PRECISION NOT NULL,
        ask_qty     DOUBLE PRECISION NOT NULL,
        spread      DOUBLE PRECISION NOT NULL,
        mid         DOUBLE PRECISION NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS uq_book_ticker_symbol_ts
        ON marketdata.book_ticker (symbol_id, ts_exchange, ts_ingest)",
    "CREATE TABLE IF NOT EXISTS marketdata.trades (
        ts_exchange    TIMESTAMPTZ NOT NULL,
        ts_ingest      TIMESTAMPTZ NOT NULL,
        symbol_id      INTEGER NOT NULL,
        agg_trade_id   BIGINT NOT NULL,
        price          DOUBLE PRECISION NOT NULL,
        qty            DOUBLE PRECISION NOT NULL,
        is_buyer_maker BOOLEAN NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS uq_trades_symbol_ts_trade
        ON marketdata.trades (symbol_id, ts_exchange, agg_trade_id)",
    "CREATE TABLE IF NOT EXISTS marketdata.depth_events (
        ts_exchange          TIMESTAMPTZ NOT NULL,
        ts_ingest            TIMESTAMPTZ NOT NULL,
        symbol_id            INTEGER NOT NULL,
        first_update_id      BIGINT NOT NULL,
        final_update_id      BIGINT NOT NULL,
        prev_final_update_id BIGINT,
        bids                 JSONB NOT NULL,
        asks                 JSONB NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS uq_depth_events_symbol_time_final
        ON marketdata.depth_events (symbol_id, ts_exchange, final_update_id)",
    "CREATE TABLE IF NOT EXISTS marketdata.orderbook_top5 (
        ts_exchange       TIMESTAMPTZ NOT NULL,
        symbol_id         INTEGER NOT NULL,
        b1_price DOUBLE PRECISION, b1_qty DOUBLE PRECISION,
        b2_price DOUBLE PRECISION, b2_qty DOUBLE PRECISION,
        b3_price DOUBLE PRECISION, b3_qty DOUBLE PRECISION,
        b4_price DOUBLE PRECISION, b4_qty DOUBLE PRECISION,
        b5_price DOUBLE PRECISION, b5_qty DOUBLE PRECISION,
        a1_price DOUBLE PRECISION, a1_qty DOUBLE PRECISION,
        a2_price DOUBLE PRECISION, a2_qty DOUBLE PRECISION,
        a3_price DOUBLE PRECISION, a3_qty DOUBLE PRECISION,
        a4_price DOUBLE PRECISION, a4_qty DOUBLE PRECISION,
        a5_price DOUBLE PRECISION, a5_qty DOUBLE PRECISION,
        microprice        DOUBLE PRECISION,
        i1                DOUBLE PRECISION,
        i5                DOUBLE PRECISION,
        wall_size_bid     DOUBLE PRECISION,
        wall_size_ask     DOUBLE PRECISION,
        wall_dist_bid_bps DOUBLE PRECISION,
        wall_dist_ask_bps DOUBLE PRECISION
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS uq_orderbook_top5_symbol_ts
        ON marketdata.orderbook_top5 (symbol_id, ts_exchange)",
    "CREATE TABLE IF NOT EXISTS marketdata.mark_price (
        ts_exchange          TIMESTAMPTZ NOT NULL,
        ts_ingest            TIMESTAMPTZ NOT NULL,
        symbol_id            INTEGER NOT NULL,
        event_type           TEXT,
        mark_price           DOUBLE PRECISION,
        index_price          DOUBLE PRECISION,
        est_settlement_price DOUBLE PRECISION,
        funding_rate         DOUBLE PRECISION,
        next_funding_time    TIMESTAMPTZ
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS uq_mark_price_symbol_ts
        ON marketdata.mark_price (symbol_id, ts_exchange)",
    "CREATE TABLE IF NOT EXISTS marketdata.force_orders (
        ts_exchange TIMESTAMPTZ NOT NULL,
        ts_ingest   TIMESTAMPTZ NOT NULL,
        symbol_id   INTEGER NOT NULL,
        side        TEXT,
        price       DOUBLE PRECISION,
        qty         DOUBLE PRECISION,
        raw         JSONB NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS uq_force_orders_symbol_ts
        ON marketdata.force_orders (symbol_id, ts_exchange)",
];

/// Event tables converted to hypertables when TimescaleDB is available.
const HYPERTABLES: &[&str] = &[
    "marketdata.book_ticker",
    "marketdata.trades",
    "marketdata.depth_events",
    "marketdata.orderbook_top5",
    "marketdata.mark_price",
    "marketdata.force_orders",
];

/// Create the schema, tables, and unique indexes, then attempt hypertable
/// conversion.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in DDL {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("DDL failed: {}", first_line(statement)))?;
    }
    info!("marketdata schema ensured");

    match sqlx::query("CREATE EXTENSION IF NOT EXISTS timescaledb")
        .execute(pool)
        .await
    {
        Ok(_) => {
            for table in HYPERTABLES {
                let convert = format!(
                    "SELECT create_hypertable('{table}', 'ts_exchange', \
                     if_not_exists => TRUE, migrate_data => TRUE)"
                );
                if let Err(e) = sqlx::query(&convert).execute(pool).await {
                    warn!(table, error = %e, "hypertable conversion skipped");
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "TimescaleDB extension unavailable, using plain tables");
        }
    }

    Ok(())
}

fn first_line(statement: &str) -> &str {
    statement.lines().next().unwrap_or(statement).trim()
}
