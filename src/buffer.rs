// =============================================================================
// Batch Buffers — per-shard, per-table staging before bulk insertion
// =============================================================================
//
// Each shard owns one buffer per table. A buffer flushes when it reaches its
// size limit, when its oldest record exceeds the age limit, or at shutdown.
// Draining swaps the vector out by value so the writer always operates on a
// detached slice while the shard keeps appending.
// =============================================================================

use std::time::{Duration, Instant};

use crate::types::{
    BookTickerEvent, DepthDiffEvent, ForceOrderEvent, MarkPriceEvent, Table, TopNRecord,
    TradeEvent,
};

/// An event annotated with its resolved symbol id, ready for insertion.
#[derive(Debug, Clone)]
pub struct Keyed<T> {
    pub symbol_id: i32,
    pub event: T,
}

// =============================================================================
// Flush limits
// =============================================================================

/// Per-table flush thresholds. `BATCH_SIZE` / `FLUSH_INTERVAL` environment
/// overrides apply to every table.
#[derive(Debug, Clone, Copy)]
pub struct BufferLimits {
    pub batch_size_override: Option<usize>,
    pub flush_interval_override: Option<Duration>,
}

impl BufferLimits {
    pub fn new(batch_size: Option<usize>, flush_interval_secs: Option<u64>) -> Self {
        Self {
            batch_size_override: batch_size,
            flush_interval_override: flush_interval_secs.map(Duration::from_secs),
        }
    }

    /// Default `(max_size, max_age)` per table.
    fn defaults(table: Table) -> (usize, Duration) {
        match table {
            Table::BookTicker => (1000, Duration::from_secs(5)),
            Table::Trades => (500, Duration::from_secs(3)),
            Table::DepthEvents => (100, Duration::from_secs(2)),
            Table::OrderbookTop5 => (200, Duration::from_secs(2)),
            Table::MarkPrice => (200, Duration::from_secs(5)),
            Table::ForceOrders => (200, Duration::from_secs(5)),
        }
    }

    pub fn for_table(&self, table: Table) -> (usize, Duration) {
        let (size, age) = Self::defaults(table);
        (
            self.batch_size_override.unwrap_or(size).max(1),
            self.flush_interval_override.unwrap_or(age),
        )
    }
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self::new(None, None)
    }
}

// =============================================================================
// One buffer
// =============================================================================

#[derive(Debug)]
pub struct BatchBuffer<T> {
    records: Vec<T>,
    created_at: Instant,
    max_size: usize,
    max_age: Duration,
}

impl<T> BatchBuffer<T> {
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        Self {
            records: Vec::with_capacity(max_size),
            created_at: Instant::now(),
            max_size,
            max_age,
        }
    }

    pub fn for_table(table: Table, limits: &BufferLimits) -> Self {
        let (max_size, max_age) = limits.for_table(table);
        Self::new(max_size, max_age)
    }

    pub fn push(&mut self, record: T) {
        if self.records.is_empty() {
            // Age is measured from the first record, not the last flush.
            self.created_at = Instant::now();
        }
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Size or age trigger. Empty buffers never flush.
    pub fn should_flush(&self) -> bool {
        if self.records.is_empty() {
            return false;
        }
        self.records.len() >= self.max_size || self.created_at.elapsed() >= self.max_age
    }

    /// Detach the accumulated records, leaving an empty buffer behind.
    pub fn drain(&mut self) -> Vec<T> {
        self.created_at = Instant::now();
        std::mem::take(&mut self.records)
    }
}

// =============================================================================
// Per-shard buffer set
// =============================================================================

#[derive(Debug)]
pub struct ShardBuffers {
    pub book_ticker: BatchBuffer<Keyed<BookTickerEvent>>,
    pub trades: BatchBuffer<Keyed<TradeEvent>>,
    pub depth_events: BatchBuffer<Keyed<DepthDiffEvent>>,
    pub orderbook_top5: BatchBuffer<TopNRecord>,
    pub mark_price: BatchBuffer<Keyed<MarkPriceEvent>>,
    pub force_orders: BatchBuffer<Keyed<ForceOrderEvent>>,
}

impl ShardBuffers {
    pub fn new(limits: &BufferLimits) -> Self {
        Self {
            book_ticker: BatchBuffer::for_table(Table::BookTicker, limits),
            trades: BatchBuffer::for_table(Table::Trades, limits),
            depth_events: BatchBuffer::for_table(Table::DepthEvents, limits),
            orderbook_top5: BatchBuffer::for_table(Table::OrderbookTop5, limits),
            mark_price: BatchBuffer::for_table(Table::MarkPrice, limits),
            force_orders: BatchBuffer::for_table(Table::ForceOrders, limits),
        }
    }

    /// Tables whose buffers currently satisfy a flush trigger.
    pub fn ready_tables(&self) -> Vec<Table> {
        let mut ready = Vec::new();
        if self.book_ticker.should_flush() {
            ready.push(Table::BookTicker);
        }
        if self.trades.should_flush() {
            ready.push(Table::Trades);
        }
        if self.depth_events.should_flush() {
            ready.push(Table::DepthEvents);
        }
        if self.orderbook_top5.should_flush() {
            ready.push(Table::OrderbookTop5);
        }
        if self.mark_price.should_flush() {
            ready.push(Table::MarkPrice);
        }
        if self.force_orders.should_flush() {
            ready.push(Table::ForceOrders);
        }
        ready
    }

    /// Tables that still hold records, regardless of triggers. Used by the
    /// shutdown path to drain everything.
    pub fn non_empty_tables(&self) -> Vec<Table> {
        let mut tables = Vec::new();
        if !self.book_ticker.is_empty() {
            tables.push(Table::BookTicker);
        }
        if !self.trades.is_empty() {
            tables.push(Table::Trades);
        }
        if !self.depth_events.is_empty() {
            tables.push(Table::DepthEvents);
        }
        if !self.orderbook_top5.is_empty() {
            tables.push(Table::OrderbookTop5);
        }
        if !self.mark_price.is_empty() {
            tables.push(Table::MarkPrice);
        }
        if !self.force_orders.is_empty() {
            tables.push(Table::ForceOrders);
        }
        tables
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn ticker(symbol: &str) -> Keyed<BookTickerEvent> {
        Keyed {
            symbol_id: 1,
            event: BookTickerEvent {
                symbol: symbol.to_string(),
                ts_exchange_ms: 1_700_000_000_000,
                ts_ingest_ms: 1_700_000_000_001,
                update_id: Some(1),
                best_bid: 1.0,
                best_ask: 2.0,
                bid_qty: 1.0,
                ask_qty: 1.0,
            },
        }
    }

    #[test]
    fn size_trigger_fires_at_max_size() {
        let mut buf = BatchBuffer::new(3, Duration::from_secs(60));
        buf.push(ticker("BTCUSDT"));
        buf.push(ticker("BTCUSDT"));
        assert!(!buf.should_flush());
        buf.push(ticker("BTCUSDT"));
        assert!(buf.should_flush());
    }

    #[test]
    fn age_trigger_fires_only_when_non_empty() {
        let mut buf: BatchBuffer<Keyed<BookTickerEvent>> =
            BatchBuffer::new(1000, Duration::from_millis(0));
        // Empty buffers never flush, however old.
        assert!(!buf.should_flush());
        buf.push(ticker("BTCUSDT"));
        assert!(buf.should_flush());
    }

    #[test]
    fn drain_detaches_and_resets() {
        let mut buf = BatchBuffer::new(2, Duration::from_secs(60));
        buf.push(ticker("BTCUSDT"));
        buf.push(ticker("ETHUSDT"));
        assert!(buf.should_flush());

        let drained = buf.drain();
        assert_eq!(drained.len(), 2);
        assert!(buf.is_empty());
        assert!(!buf.should_flush());
    }

    #[test]
    fn overrides_apply_to_every_table() {
        let limits = BufferLimits::new(Some(42), Some(9));
        for table in Table::ALL {
            let (size, age) = limits.for_table(table);
            assert_eq!(size, 42);
            assert_eq!(age, Duration::from_secs(9));
        }
    }

    #[test]
    fn default_limits_match_table_profiles() {
        let limits = BufferLimits::default();
        assert_eq!(limits.for_table(Table::BookTicker), (1000, Duration::from_secs(5)));
        assert_eq!(limits.for_table(Table::Trades), (500, Duration::from_secs(3)));
        assert_eq!(limits.for_table(Table::DepthEvents), (100, Duration::from_secs(2)));
        assert_eq!(limits.for_table(Table::OrderbookTop5), (200, Duration::from_secs(2)));
    }

    #[test]
    fn ready_and_non_empty_views_agree_on_shutdown_drain() {
        let limits = BufferLimits::default();
        let mut buffers = ShardBuffers::new(&limits);
        assert!(buffers.ready_tables().is_empty());
        assert!(buffers.non_empty_tables().is_empty());

        // A single record is below every size threshold and fresh, so it is
        // not "ready" but must still be visible to the shutdown drain.
        buffers.book_ticker.push(ticker("BTCUSDT"));
        assert!(buffers.ready_tables().is_empty());
        assert_eq!(buffers.non_empty_tables(), vec![Table::BookTicker]);
    }
}
