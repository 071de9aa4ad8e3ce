// =============================================================================
// Batch Writer — idempotent bulk insertion, one transaction per batch
// =============================================================================
//
// Every insert is a single multi-row `INSERT ... ON CONFLICT <key> DO
// NOTHING` against the table's uniqueness key, chunked to stay under the
// Postgres bind limit. Transient store failures (connection/pool/timeout)
// retain the batch and retry with exponential backoff; database-reported
// errors (constraint or schema mismatch) drop the batch, count it as failed,
// and never halt the pipeline.
//
// In dry-run mode there is no pool at all: batches are counted and discarded.
// =============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, error, warn};

use crate::buffer::Keyed;
use crate::metrics::Metrics;
use crate::types::{
    ms_to_datetime, BookTickerEvent, DepthDiffEvent, DepthLevel, ForceOrderEvent, MarkPriceEvent,
    Table, TopNRecord, TradeEvent,
};

/// Stay well below the Postgres limit of 65 535 binds per statement.
const MAX_BINDS_PER_STATEMENT: usize = 60_000;

const MAX_WRITE_RETRIES: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

/// Rows per statement for a table with `cols` bound columns.
const fn chunk_rows(cols: usize) -> usize {
    MAX_BINDS_PER_STATEMENT / cols
}

/// Whether a failed write is worth retrying. Database-reported errors are
/// permanent: retrying a constraint or schema mismatch can never succeed.
fn is_transient(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Protocol(_)
    )
}

/// Serialize depth levels the way the exchange sends them: `[[price, qty]]`.
fn levels_json(levels: &[DepthLevel]) -> serde_json::Value {
    serde_json::Value::Array(
        levels
            .iter()
            .map(|l| serde_json::json!([l.price, l.qty]))
            .collect(),
    )
}

pub struct BatchWriter {
    pool: Option<PgPool>,
    metrics: Arc<Metrics>,
}

impl BatchWriter {
    pub fn new(pool: PgPool, metrics: Arc<Metrics>) -> Self {
        Self {
            pool: Some(pool),
            metrics,
        }
    }

    /// Writer without a store: batches are accounted for and discarded.
    pub fn dry_run(metrics: Arc<Metrics>) -> Self {
        Self {
            pool: None,
            metrics,
        }
    }

    // =========================================================================
    // Public insert surface, one method per table
    // =========================================================================

    pub async fn insert_book_ticker(&self, records: Vec<Keyed<BookTickerEvent>>) {
        let max_ts = max_ts(records.iter().map(|r| r.event.ts_exchange_ms));
        self.drive(Table::BookTicker, records.len() as u64, max_ts, || {
            self.try_book_ticker(&records)
        })
        .await;
    }

    pub async fn insert_trades(&self, records: Vec<Keyed<TradeEvent>>) {
        let max_ts = max_ts(records.iter().map(|r| r.event.ts_exchange_ms));
        self.drive(Table::Trades, records.len() as u64, max_ts, || {
            self.try_trades(&records)
        })
        .await;
    }

    pub async fn insert_depth(&self, records: Vec<Keyed<DepthDiffEvent>>) {
        let max_ts = max_ts(records.iter().map(|r| r.event.ts_exchange_ms));
        self.drive(Table::DepthEvents, records.len() as u64, max_ts, || {
            self.try_depth(&records)
        })
        .await;
    }

    pub async fn insert_top5(&self, records: Vec<TopNRecord>) {
        let max_ts = max_ts(records.iter().map(|r| r.ts_exchange_ms));
        self.drive(Table::OrderbookTop5, records.len() as u64, max_ts, || {
            self.try_top5(&records)
        })
        .await;
    }

    pub async fn insert_mark(&self, records: Vec<Keyed<MarkPriceEvent>>) {
        let max_ts = max_ts(records.iter().map(|r| r.event.ts_exchange_ms));
        self.drive(Table::MarkPrice, records.len() as u64, max_ts, || {
            self.try_mark(&records)
        })
        .await;
    }

    pub async fn insert_force(&self, records: Vec<Keyed<ForceOrderEvent>>) {
        let max_ts = max_ts(records.iter().map(|r| r.event.ts_exchange_ms));
        self.drive(Table::ForceOrders, records.len() as u64, max_ts, || {
            self.try_force(&records)
        })
        .await;
    }

    // =========================================================================
    // Retry driver
    // =========================================================================

    /// Run `op` until it succeeds, the retry budget is spent, or a permanent
    /// error drops the batch. Metrics are recorded exactly once per batch.
    async fn drive<Fut>(&self, table: Table, rows: u64, max_ts: i64, mut op: impl FnMut() -> Fut)
    where
        Fut: Future<Output = Result<(), sqlx::Error>>,
    {
        if rows == 0 {
            return;
        }

        if self.pool.is_none() {
            debug!(table = %table, rows, "dry-run, batch discarded");
            self.metrics.table(table).record_written(rows, max_ts);
            return;
        }

        let mut attempt: u32 = 0;
        let mut delay = RETRY_BASE_DELAY;

        loop {
            match op().await {
                Ok(()) => {
                    self.metrics.table(table).record_written(rows, max_ts);
                    debug!(table = %table, rows, "batch written");
                    return;
                }
                Err(e) if is_transient(&e) && attempt < MAX_WRITE_RETRIES => {
                    attempt += 1;
                    warn!(
                        table = %table,
                        rows,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient store failure, batch retained"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_MAX_DELAY);
                }
                Err(e) => {
                    self.metrics.table(table).record_failed(rows);
                    error!(table = %table, rows, error = %e, "batch dropped");
                    return;
                }
            }
        }
    }

    fn pool(&self) -> &PgPool {
        // drive() short-circuits before any try_* runs without a pool.
        self.pool.as_ref().expect("writer has no pool")
    }

    // =========================================================================
    // Per-table statements
    // =========================================================================

    async fn try_book_ticker(&self, records: &[Keyed<BookTickerEvent>]) -> Result<(), sqlx::Error> {
        for chunk in records.chunks(chunk_rows(10)) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO marketdata.book_ticker \
                 (ts_exchange, ts_ingest, symbol_id, update_id, \
                  best_bid, best_ask, bid_qty, ask_qty, spread, mid) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(ms_to_datetime(r.event.ts_exchange_ms))
                    .push_bind(ms_to_datetime(r.event.ts_ingest_ms))
                    .push_bind(r.symbol_id)
                    .push_bind(r.event.update_id)
                    .push_bind(r.event.best_bid)
                    .push_bind(r.event.best_ask)
                    .push_bind(r.event.bid_qty)
                    .push_bind(r.event.ask_qty)
                    .push_bind(r.event.spread())
                    .push_bind(r.event.mid());
            });
            qb.push(" ON CONFLICT (symbol_id, ts_exchange, ts_ingest) DO NOTHING");
            qb.build().execute(self.pool()).await?;
        }
        Ok(())
    }

    async fn try_trades(&self, records: &[Keyed<TradeEvent>]) -> Result<(), sqlx::Error> {
        for chunk in records.chunks(chunk_rows(7)) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO marketdata.trades \
                 (ts_exchange, ts_ingest, symbol_id, agg_trade_id, price, qty, is_buyer_maker) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(ms_to_datetime(r.event.ts_exchange_ms))
                    .push_bind(ms_to_datetime(r.event.ts_ingest_ms))
                    .push_bind(r.symbol_id)
                    .push_bind(r.event.agg_trade_id)
                    .push_bind(r.event.price)
                    .push_bind(r.event.qty)
                    .push_bind(r.event.is_buyer_maker);
            });
            qb.push(" ON CONFLICT (symbol_id, ts_exchange, agg_trade_id) DO NOTHING");
            qb.build().execute(self.pool()).await?;
        }
        Ok(())
    }

    async fn try_depth(&self, records: &[Keyed<DepthDiffEvent>]) -> Result<(), sqlx::Error> {
        for chunk in records.chunks(chunk_rows(8)) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO marketdata.depth_events \
                 (ts_exchange, ts_ingest, symbol_id, first_update_id, final_update_id, \
                  prev_final_update_id, bids, asks) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(ms_to_datetime(r.event.ts_exchange_ms))
                    .push_bind(ms_to_datetime(r.event.ts_ingest_ms))
                    .push_bind(r.symbol_id)
                    .push_bind(r.event.first_update_id)
                    .push_bind(r.event.final_update_id)
                    .push_bind(r.event.prev_final_update_id)
                    .push_bind(levels_json(&r.event.bids))
                    .push_bind(levels_json(&r.event.asks));
            });
            qb.push(" ON CONFLICT (symbol_id, ts_exchange, final_update_id) DO NOTHING");
            qb.build().execute(self.pool()).await?;
        }
        Ok(())
    }

    async fn try_top5(&self, records: &[TopNRecord]) -> Result<(), sqlx::Error> {
        for chunk in records.chunks(chunk_rows(29)) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO marketdata.orderbook_top5 \
                 (ts_exchange, symbol_id, \
                  b1_price, b1_qty, b2_price, b2_qty, b3_price, b3_qty, \
                  b4_price, b4_qty, b5_price, b5_qty, \
                  a1_price, a1_qty, a2_price, a2_qty, a3_price, a3_qty, \
                  a4_price, a4_qty, a5_price, a5_qty, \
                  microprice, i1, i5, wall_size_bid, wall_size_ask, \
                  wall_dist_bid_bps, wall_dist_ask_bps) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(ms_to_datetime(r.ts_exchange_ms)).push_bind(r.symbol_id);
                for level in &r.bids {
                    b.push_bind(level.map(|l| l.price)).push_bind(level.map(|l| l.qty));
                }
                for level in &r.asks {
                    b.push_bind(level.map(|l| l.price)).push_bind(level.map(|l| l.qty));
                }
                b.push_bind(r.microprice)
                    .push_bind(r.i1)
                    .push_bind(r.i5)
                    .push_bind(r.wall_size_bid)
                    .push_bind(r.wall_size_ask)
                    .push_bind(r.wall_dist_bid_bps)
                    .push_bind(r.wall_dist_ask_bps);
            });
            qb.push(" ON CONFLICT (symbol_id, ts_exchange) DO NOTHING");
            qb.build().execute(self.pool()).await?;
        }
        Ok(())
    }

    async fn try_mark(&self, records: &[Keyed<MarkPriceEvent>]) -> Result<(), sqlx::Error> {
        for chunk in records.chunks(chunk_rows(9)) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO marketdata.mark_price \
                 (ts_exchange, ts_ingest, symbol_id, event_type, mark_price, index_price, \
                  est_settlement_price, funding_rate, next_funding_time) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(ms_to_datetime(r.event.ts_exchange_ms))
                    .push_bind(ms_to_datetime(r.event.ts_ingest_ms))
                    .push_bind(r.symbol_id)
                    .push_bind(r.event.event_type.clone())
                    .push_bind(r.event.mark_price)
                    .push_bind(r.event.index_price)
                    .push_bind(r.event.est_settlement_price)
                    .push_bind(r.event.funding_rate)
                    .push_bind(r.event.next_funding_time_ms.map(ms_to_datetime));
            });
            qb.push(" ON CONFLICT (symbol_id, ts_exchange) DO NOTHING");
            qb.build().execute(self.pool()).await?;
        }
        Ok(())
    }

    async fn try_force(&self, records: &[Keyed<ForceOrderEvent>]) -> Result<(), sqlx::Error> {
        for chunk in records.chunks(chunk_rows(7)) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO marketdata.force_orders \
                 (ts_exchange, ts_ingest, symbol_id, side, price, qty, raw) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(ms_to_datetime(r.event.ts_exchange_ms))
                    .push_bind(ms_to_datetime(r.event.ts_ingest_ms))
                    .push_bind(r.symbol_id)
                    .push_bind(r.event.side.clone())
                    .push_bind(r.event.price)
                    .push_bind(r.event.qty)
                    .push_bind(r.event.raw.clone());
            });
            qb.push(" ON CONFLICT (symbol_id, ts_exchange) DO NOTHING");
            qb.build().execute(self.pool()).await?;
        }
        Ok(())
    }
}

fn max_ts(timestamps: impl Iterator<Item = i64>) -> i64 {
    timestamps.max().unwrap_or(0)
}
