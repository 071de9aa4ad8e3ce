// =============================================================================
// Shared types used across the Helios collector
// =============================================================================

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Exchange identifier stamped on every persisted symbol row.
pub const EXCHANGE: &str = "binance-futures";

/// Convert an exchange millisecond timestamp into a timezone-aware instant.
///
/// Out-of-range values (the exchange occasionally sends 0 for missing
/// fields) clamp to the UNIX epoch rather than panicking.
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// =============================================================================
// Channels
// =============================================================================

/// A Binance Futures stream channel the collector knows how to subscribe to
/// and decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    BookTicker,
    AggTrade,
    Depth,
    MarkPrice,
    ForceOrder,
}

impl ChannelKind {
    /// Stream suffix appended to the lowercased symbol in subscription URLs,
    /// e.g. `btcusdt@depth@100ms`.
    pub fn stream_suffix(&self) -> &'static str {
        match self {
            Self::BookTicker => "bookTicker",
            Self::AggTrade => "aggTrade",
            Self::Depth => "depth@100ms",
            Self::MarkPrice => "markPrice@1s",
            Self::ForceOrder => "forceOrder",
        }
    }

    /// Parse a channel name as it appears in the `CHANNELS` environment
    /// variable. Rate suffixes (`@100ms`, `@1s`) are accepted and ignored.
    pub fn parse(s: &str) -> Option<Self> {
        let base = s.trim().split('@').next().unwrap_or("");
        match base {
            "bookTicker" => Some(Self::BookTicker),
            "aggTrade" => Some(Self::AggTrade),
            "depth" => Some(Self::Depth),
            "markPrice" => Some(Self::MarkPrice),
            "forceOrder" => Some(Self::ForceOrder),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.stream_suffix())
    }
}

// =============================================================================
// Persisted tables
// =============================================================================

/// The six event tables in the `marketdata` schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    BookTicker,
    Trades,
    DepthEvents,
    OrderbookTop5,
    MarkPrice,
    ForceOrders,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::BookTicker,
        Table::Trades,
        Table::DepthEvents,
        Table::OrderbookTop5,
        Table::MarkPrice,
        Table::ForceOrders,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::BookTicker => "book_ticker",
            Self::Trades => "trades",
            Self::DepthEvents => "depth_events",
            Self::OrderbookTop5 => "orderbook_top5",
            Self::MarkPrice => "mark_price",
            Self::ForceOrders => "force_orders",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Market events
// =============================================================================

/// One price level of a depth diff: `qty == 0.0` means "remove this price".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub qty: f64,
}

/// Best bid/ask update from `<sym>@bookTicker`.
#[derive(Debug, Clone)]
pub struct BookTickerEvent {
    pub symbol: String,
    pub ts_exchange_ms: i64,
    pub ts_ingest_ms: i64,
    pub update_id: Option<i64>,
    pub best_bid: f64,
    pub best_ask: f64,
    pub bid_qty: f64,
    pub ask_qty: f64,
}

impl BookTickerEvent {
    pub fn spread(&self) -> f64 {
        self.best_ask - self.best_bid
    }

    pub fn mid(&self) -> f64 {
        (self.best_ask + self.best_bid) / 2.0
    }
}

/// Aggregated trade from `<sym>@aggTrade`.
#[derive(Debug, Clone)]
pub struct TradeEvent {
    pub symbol: String,
    pub ts_exchange_ms: i64,
    pub ts_ingest_ms: i64,
    pub agg_trade_id: i64,
    pub price: f64,
    pub qty: f64,
    pub is_buyer_maker: bool,
}

/// Incremental order-book update from `<sym>@depth@100ms`, identified by the
/// inclusive update-id range `[first_update_id, final_update_id]`.
#[derive(Debug, Clone)]
pub struct DepthDiffEvent {
    pub symbol: String,
    pub ts_exchange_ms: i64,
    pub ts_ingest_ms: i64,
    pub first_update_id: i64,
    pub final_update_id: i64,
    pub prev_final_update_id: Option<i64>,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

/// Mark/index price update from `<sym>@markPrice@1s`.
#[derive(Debug, Clone)]
pub struct MarkPriceEvent {
    pub symbol: String,
    pub ts_exchange_ms: i64,
    pub ts_ingest_ms: i64,
    pub event_type: Option<String>,
    pub mark_price: Option<f64>,
    pub index_price: Option<f64>,
    pub est_settlement_price: Option<f64>,
    pub funding_rate: Option<f64>,
    pub next_funding_time_ms: Option<i64>,
}

/// Liquidation order from `<sym>@forceOrder`. The full exchange envelope is
/// retained for downstream analysis.
#[derive(Debug, Clone)]
pub struct ForceOrderEvent {
    pub symbol: String,
    pub ts_exchange_ms: i64,
    pub ts_ingest_ms: i64,
    pub side: Option<String>,
    pub price: Option<f64>,
    pub qty: Option<f64>,
    pub raw: serde_json::Value,
}

/// A decoded frame from any subscribed channel.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    BookTicker(BookTickerEvent),
    Trade(TradeEvent),
    DepthDiff(DepthDiffEvent),
    MarkPrice(MarkPriceEvent),
    ForceOrder(ForceOrderEvent),
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            Self::BookTicker(e) => &e.symbol,
            Self::Trade(e) => &e.symbol,
            Self::DepthDiff(e) => &e.symbol,
            Self::MarkPrice(e) => &e.symbol,
            Self::ForceOrder(e) => &e.symbol,
        }
    }

    pub fn channel(&self) -> ChannelKind {
        match self {
            Self::BookTicker(_) => ChannelKind::BookTicker,
            Self::Trade(_) => ChannelKind::AggTrade,
            Self::DepthDiff(_) => ChannelKind::Depth,
            Self::MarkPrice(_) => ChannelKind::MarkPrice,
            Self::ForceOrder(_) => ChannelKind::ForceOrder,
        }
    }
}

// =============================================================================
// Top-5 snapshot records
// =============================================================================

/// One resting level in the reconstructed book.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookLevel {
    pub price: f64,
    pub qty: f64,
}

/// A per-event snapshot of the reconstructed top-5 book with derived
/// microstructure features, keyed by `(symbol_id, ts_exchange)`.
#[derive(Debug, Clone)]
pub struct TopNRecord {
    pub ts_exchange_ms: i64,
    pub symbol_id: i32,
    /// Best five bid levels, descending by price.
    pub bids: [Option<BookLevel>; 5],
    /// Best five ask levels, ascending by price.
    pub asks: [Option<BookLevel>; 5],
    pub microprice: Option<f64>,
    pub i1: Option<f64>,
    pub i5: Option<f64>,
    pub wall_size_bid: Option<f64>,
    pub wall_size_ask: Option<f64>,
    pub wall_dist_bid_bps: Option<f64>,
    pub wall_dist_ask_bps: Option<f64>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn book_ticker_derived_fields() {
        let e = BookTickerEvent {
            symbol: "BTCUSDT".to_string(),
            ts_exchange_ms: 1_700_000_000_000,
            ts_ingest_ms: 1_700_000_000_050,
            update_id: Some(42),
            best_bid: 50_000.0,
            best_ask: 50_001.0,
            bid_qty: 1.0,
            ask_qty: 2.0,
        };
        assert!((e.spread() - 1.0).abs() < f64::EPSILON);
        assert!((e.mid() - 50_000.5).abs() < f64::EPSILON);
    }

    #[test]
    fn channel_parse_accepts_rate_suffixes() {
        assert_eq!(ChannelKind::parse("bookTicker"), Some(ChannelKind::BookTicker));
        assert_eq!(ChannelKind::parse("depth@100ms"), Some(ChannelKind::Depth));
        assert_eq!(ChannelKind::parse("depth"), Some(ChannelKind::Depth));
        assert_eq!(ChannelKind::parse("markPrice@1s"), Some(ChannelKind::MarkPrice));
        assert_eq!(ChannelKind::parse(" forceOrder "), Some(ChannelKind::ForceOrder));
        assert_eq!(ChannelKind::parse("kline_1m"), None);
    }

    #[test]
    fn channel_suffix_round_trip() {
        for ch in [
            ChannelKind::BookTicker,
            ChannelKind::AggTrade,
            ChannelKind::Depth,
            ChannelKind::MarkPrice,
            ChannelKind::ForceOrder,
        ] {
            assert_eq!(ChannelKind::parse(ch.stream_suffix()), Some(ch));
        }
    }

    #[test]
    fn ms_conversion_clamps_out_of_range() {
        let dt = ms_to_datetime(1_700_000_000_000);
        assert_eq!(dt.timestamp_millis(), 1_700_000_000_000);
        let epoch = ms_to_datetime(i64::MAX);
        assert_eq!(epoch.timestamp_millis(), 0);
    }
}
