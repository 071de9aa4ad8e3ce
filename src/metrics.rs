// =============================================================================
// Metrics Registry — per-shard and per-table counters for the status surface
// =============================================================================
//
// All counters are lock-free atomics updated from the hot paths; the only
// lock is a short read-mostly RwLock around each shard's connection state.
// `snapshot()` renders everything as JSON for the /metrics endpoint.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::types::{now_ms, Table};

// =============================================================================
// Connection lifecycle
// =============================================================================

/// Lifecycle state of one shard's WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// Per-shard metrics
// =============================================================================

#[derive(Debug)]
pub struct ShardMetrics {
    pub shard_id: usize,
    pub label: String,
    pub symbols_count: usize,
    state: RwLock<ConnectionState>,
    pub messages_received: AtomicU64,
    pub messages_decoded: AtomicU64,
    pub parse_errors: AtomicU64,
    pub dropped: AtomicU64,
    pub reconnects: AtomicU64,
    pub last_message_ms: AtomicI64,
}

impl ShardMetrics {
    pub fn new(shard_id: usize, label: impl Into<String>, symbols_count: usize) -> Self {
        Self {
            shard_id,
            label: label.into(),
            symbols_count,
            state: RwLock::new(ConnectionState::Disconnected),
            messages_received: AtomicU64::new(0),
            messages_decoded: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_message_ms: AtomicI64::new(0),
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.last_message_ms.store(now_ms(), Ordering::Relaxed);
    }
}

// =============================================================================
// Per-table metrics
// =============================================================================

#[derive(Debug, Default)]
pub struct TableMetrics {
    pub rows_written: AtomicU64,
    pub rows_failed: AtomicU64,
    pub batches_written: AtomicU64,
    pub batches_failed: AtomicU64,
    /// Freshness: max `ts_exchange` (ms) seen in a successful write.
    pub max_ts_exchange_ms: AtomicI64,
}

impl TableMetrics {
    pub fn record_written(&self, rows: u64, max_ts_exchange_ms: i64) {
        self.rows_written.fetch_add(rows, Ordering::Relaxed);
        self.batches_written.fetch_add(1, Ordering::Relaxed);
        self.max_ts_exchange_ms
            .fetch_max(max_ts_exchange_ms, Ordering::Relaxed);
    }

    pub fn record_failed(&self, rows: u64) {
        self.rows_failed.fetch_add(rows, Ordering::Relaxed);
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug)]
pub struct Metrics {
    started_at_ms: i64,
    shards: RwLock<Vec<Arc<ShardMetrics>>>,
    tables: HashMap<Table, TableMetrics>,
    pub watchdog_cancels: AtomicU64,
    pub book_resyncs: AtomicU64,
    pub book_gaps: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at_ms: now_ms(),
            shards: RwLock::new(Vec::new()),
            tables: Table::ALL
                .into_iter()
                .map(|t| (t, TableMetrics::default()))
                .collect(),
            watchdog_cancels: AtomicU64::new(0),
            book_resyncs: AtomicU64::new(0),
            book_gaps: AtomicU64::new(0),
        }
    }

    /// Register a shard and return its metrics handle.
    pub fn register_shard(
        &self,
        shard_id: usize,
        label: impl Into<String>,
        symbols_count: usize,
    ) -> Arc<ShardMetrics> {
        let shard = Arc::new(ShardMetrics::new(shard_id, label, symbols_count));
        self.shards.write().push(shard.clone());
        shard
    }

    pub fn table(&self, table: Table) -> &TableMetrics {
        // The map is populated with every variant at construction.
        &self.tables[&table]
    }

    /// True when every registered shard has a live connection.
    pub fn all_shards_connected(&self) -> bool {
        let shards = self.shards.read();
        !shards.is_empty() && shards.iter().all(|s| s.state() == ConnectionState::Connected)
    }

    /// Render the full registry as JSON for the status endpoints.
    pub fn snapshot(&self) -> serde_json::Value {
        let shards: Vec<serde_json::Value> = self
            .shards
            .read()
            .iter()
            .map(|s| {
                serde_json::json!({
                    "shard_id": s.shard_id,
                    "label": s.label,
                    "symbols": s.symbols_count,
                    "state": s.state().to_string(),
                    "messages_received": s.messages_received.load(Ordering::Relaxed),
                    "messages_decoded": s.messages_decoded.load(Ordering::Relaxed),
                    "parse_errors": s.parse_errors.load(Ordering::Relaxed),
                    "dropped": s.dropped.load(Ordering::Relaxed),
                    "reconnects": s.reconnects.load(Ordering::Relaxed),
                    "last_message_ms": s.last_message_ms.load(Ordering::Relaxed),
                })
            })
            .collect();

        let mut tables = serde_json::Map::new();
        for table in Table::ALL {
            let t = self.table(table);
            let max_ts = t.max_ts_exchange_ms.load(Ordering::Relaxed);
            tables.insert(
                table.name().to_string(),
                serde_json::json!({
                    "rows_written": t.rows_written.load(Ordering::Relaxed),
                    "rows_failed": t.rows_failed.load(Ordering::Relaxed),
                    "batches_written": t.batches_written.load(Ordering::Relaxed),
                    "batches_failed": t.batches_failed.load(Ordering::Relaxed),
                    "max_ts_exchange_ms": if max_ts > 0 { Some(max_ts) } else { None },
                }),
            );
        }

        serde_json::json!({
            "uptime_secs": (now_ms() - self.started_at_ms) / 1000,
            "shards": shards,
            "tables": tables,
            "watchdog_cancels": self.watchdog_cancels.load(Ordering::Relaxed),
            "book_resyncs": self.book_resyncs.load(Ordering::Relaxed),
            "book_gaps": self.book_gaps.load(Ordering::Relaxed),
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_registration_and_state_transitions() {
        let metrics = Metrics::new();
        let shard = metrics.register_shard(0, "main-0", 10);

        assert_eq!(shard.state(), ConnectionState::Disconnected);
        assert!(!metrics.all_shards_connected());

        shard.set_state(ConnectionState::Connected);
        assert!(metrics.all_shards_connected());

        shard.set_state(ConnectionState::Reconnecting);
        assert!(!metrics.all_shards_connected());
    }

    #[test]
    fn table_freshness_tracks_max_timestamp() {
        let metrics = Metrics::new();
        let t = metrics.table(Table::BookTicker);

        t.record_written(10, 1_700_000_000_000);
        t.record_written(5, 1_600_000_000_000);
        assert_eq!(t.max_ts_exchange_ms.load(Ordering::Relaxed), 1_700_000_000_000);
        assert_eq!(t.rows_written.load(Ordering::Relaxed), 15);
        assert_eq!(t.batches_written.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn snapshot_contains_all_tables() {
        let metrics = Metrics::new();
        metrics.register_shard(0, "main-0", 3);
        let snap = metrics.snapshot();

        let tables = snap["tables"].as_object().unwrap();
        for table in Table::ALL {
            assert!(tables.contains_key(table.name()), "missing {table}");
        }
        assert_eq!(snap["shards"].as_array().unwrap().len(), 1);
        assert!(snap["tables"]["book_ticker"]["max_ts_exchange_ms"].is_null());
    }
}
