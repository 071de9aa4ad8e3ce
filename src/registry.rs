// =============================================================================
// Symbol Registry — symbol name to stable id, cached in front of the store
// =============================================================================
//
// The cache is read-mostly: lookups take a shared lock, and only the first
// observation of a symbol takes the exclusive lock after the upsert returns.
// The lock is never held across an await. One id per (exchange, symbol) is
// guaranteed by the unique constraint, so concurrent first observations of
// the same symbol converge on the same id.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::types::EXCHANGE;

const UPSERT_SYMBOL: &str = "\
    INSERT INTO marketdata.symbols (exchange, symbol, base_asset, quote_asset) \
    VALUES ($1, $2, split_part($2, 'USDT', 1), 'USDT') \
    ON CONFLICT (exchange, symbol) DO UPDATE SET updated_at = NOW() \
    RETURNING id";

pub struct SymbolRegistry {
    pool: Option<PgPool>,
    cache: RwLock<HashMap<String, i32>>,
    /// Ephemeral id sequence for dry-run mode.
    next_dry_id: AtomicI32,
}

impl SymbolRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Some(pool),
            cache: RwLock::new(HashMap::new()),
            next_dry_id: AtomicI32::new(1),
        }
    }

    /// Registry without a store: ids are handed out from a process-local
    /// sequence and never persisted.
    pub fn dry_run() -> Self {
        Self {
            pool: None,
            cache: RwLock::new(HashMap::new()),
            next_dry_id: AtomicI32::new(1),
        }
    }

    /// Load all active symbols for this exchange in one query.
    pub async fn preload(&self) -> Result<usize> {
        let Some(pool) = &self.pool else {
            return Ok(0);
        };

        let rows: Vec<(i32, String)> = sqlx::query_as(
            "SELECT id, symbol FROM marketdata.symbols \
             WHERE is_active = TRUE AND exchange = $1",
        )
        .bind(EXCHANGE)
        .fetch_all(pool)
        .await
        .context("failed to preload symbol cache")?;

        let count = rows.len();
        let mut cache = self.cache.write();
        for (id, symbol) in rows {
            cache.insert(symbol, id);
        }
        drop(cache);

        info!(count, "symbol cache preloaded");
        Ok(count)
    }

    /// Resolve a symbol to its id, upserting on first observation.
    pub async fn resolve(&self, symbol: &str) -> Result<i32> {
        if let Some(id) = self.cache.read().get(symbol) {
            return Ok(*id);
        }

        let id = match &self.pool {
            None => self.next_dry_id.fetch_add(1, Ordering::Relaxed),
            Some(pool) => sqlx::query_scalar(UPSERT_SYMBOL)
                .bind(EXCHANGE)
                .bind(symbol)
                .fetch_one(pool)
                .await
                .with_context(|| format!("failed to upsert symbol {symbol}"))?,
        };

        // Another task may have resolved the same symbol while the upsert
        // was in flight; both got the same id from the store.
        self.cache.write().entry(symbol.to_string()).or_insert(id);
        debug!(symbol, id, "symbol resolved");
        Ok(id)
    }

    pub fn cached_count(&self) -> usize {
        self.cache.read().len()
    }
}
