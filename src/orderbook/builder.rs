// =============================================================================
// TopN Builder — per-symbol snapshot+diff synchronization and record emission
// =============================================================================
//
// Each symbol's book is guarded by its own async mutex so that a REST
// snapshot fetch for one symbol never blocks the others. The mutex is held
// across the fetch: depth diffs for that symbol queue behind it, which is
// exactly the ordering the sequencing rules require.
//
// Snapshot fetches are rate-limited per symbol (the exchange weighs
// `depth?limit=1000` heavily) and five consecutive gaps put the symbol into
// a cooldown that suppresses emission until a resync completes.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::binance::FuturesRest;
use crate::metrics::Metrics;
use crate::orderbook::book::{BookState, DiffAction};
use crate::orderbook::features;
use crate::types::{BookLevel, DepthDiffEvent, TopNRecord};

/// Levels requested from the REST snapshot endpoint.
const SNAPSHOT_LIMIT: u32 = 1000;

/// Minimum spacing between snapshot fetches for one symbol.
const SNAPSHOT_MIN_INTERVAL: Duration = Duration::from_secs(2);

/// Consecutive gaps before the symbol cools down.
const GAP_COOLDOWN_THRESHOLD: u32 = 5;

/// Levels emitted per side.
const TOP_N: usize = 5;

// =============================================================================
// Per-symbol state
// =============================================================================

#[derive(Debug, Default)]
struct SymbolBook {
    book: BookState,
    /// False until a diff has been applied on top of the current snapshot.
    synced: bool,
    consecutive_gaps: u32,
    /// Set after `GAP_COOLDOWN_THRESHOLD` gaps; cleared by the next resync.
    cooldown: bool,
    last_snapshot_attempt: Option<Instant>,
}

impl SymbolBook {
    fn snapshot_allowed(&self) -> bool {
        match self.last_snapshot_attempt {
            Some(at) => at.elapsed() >= SNAPSHOT_MIN_INTERVAL,
            None => true,
        }
    }
}

/// Outcome of sequencing one diff against the in-memory book.
#[derive(Debug)]
enum DiffOutcome {
    /// The book needs a REST snapshot before this diff can be judged.
    NeedSnapshot,
    /// Stale or otherwise discarded; nothing changed.
    Ignored,
    /// Applied; `emitted` is `None` while resuming from cooldown.
    Applied { emitted: Option<TopNRecord> },
}

/// Sequence one diff. Pure with respect to I/O: snapshot fetches are the
/// caller's job.
fn handle_diff(
    state: &mut SymbolBook,
    diff: &DepthDiffEvent,
    symbol_id: i32,
    metrics: &Metrics,
) -> DiffOutcome {
    match state.book.classify(diff.first_update_id, diff.final_update_id) {
        DiffAction::Bootstrap => DiffOutcome::NeedSnapshot,
        DiffAction::Stale => DiffOutcome::Ignored,
        DiffAction::Gap => {
            metrics.book_gaps.fetch_add(1, Ordering::Relaxed);
            state.synced = false;
            state.consecutive_gaps += 1;
            if state.consecutive_gaps >= GAP_COOLDOWN_THRESHOLD && !state.cooldown {
                state.cooldown = true;
                warn!(
                    symbol = %diff.symbol,
                    gaps = state.consecutive_gaps,
                    "repeated sequence gaps, entering cooldown"
                );
            }
            DiffOutcome::NeedSnapshot
        }
        DiffAction::Apply => {
            state.book.apply_diff(diff);
            state.consecutive_gaps = 0;
            state.synced = true;

            if state.book.is_crossed() {
                // Applied verbatim per the exchange's data; flagged for
                // operators because a synced book should never cross.
                warn!(symbol = %diff.symbol, "book crossed after diff application");
            }

            if state.cooldown {
                // The resync is complete; emission resumes with the next diff.
                state.cooldown = false;
                info!(symbol = %diff.symbol, "cooldown cleared after successful resync");
                return DiffOutcome::Applied { emitted: None };
            }

            let (bids, asks) = state.book.top_levels(TOP_N);
            let f = features::compute(&bids, &asks);
            DiffOutcome::Applied {
                emitted: Some(TopNRecord {
                    ts_exchange_ms: diff.ts_exchange_ms,
                    symbol_id,
                    bids: to_fixed(&bids),
                    asks: to_fixed(&asks),
                    microprice: f.microprice,
                    i1: f.i1,
                    i5: f.i5,
                    wall_size_bid: f.wall_size_bid,
                    wall_size_ask: f.wall_size_ask,
                    wall_dist_bid_bps: f.wall_dist_bid_bps,
                    wall_dist_ask_bps: f.wall_dist_ask_bps,
                }),
            }
        }
    }
}

fn to_fixed(levels: &[BookLevel]) -> [Option<BookLevel>; 5] {
    let mut fixed = [None; 5];
    for (slot, level) in fixed.iter_mut().zip(levels.iter()) {
        *slot = Some(*level);
    }
    fixed
}

// =============================================================================
// Builder
// =============================================================================

pub struct TopNBuilder {
    rest: FuturesRest,
    states: RwLock<HashMap<String, Arc<Mutex<SymbolBook>>>>,
    metrics: Arc<Metrics>,
}

impl TopNBuilder {
    pub fn new(rest: FuturesRest, metrics: Arc<Metrics>) -> Self {
        Self {
            rest,
            states: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Process one depth diff and return a top-5 record when the book was
    /// advanced while synced. REST snapshot fetches happen here, under the
    /// symbol's lock.
    pub async fn process_event(
        &self,
        diff: &DepthDiffEvent,
        symbol_id: i32,
    ) -> Option<TopNRecord> {
        let state = self.state_for(&diff.symbol);
        let mut guard = state.lock().await;

        match handle_diff(&mut guard, diff, symbol_id, &self.metrics) {
            DiffOutcome::Applied { emitted } => emitted,
            DiffOutcome::Ignored => None,
            DiffOutcome::NeedSnapshot => {
                let cold_start = guard.book.last_update_id.is_none();

                if !guard.snapshot_allowed() {
                    debug!(symbol = %diff.symbol, "snapshot fetch suppressed by backoff");
                    return None;
                }
                guard.last_snapshot_attempt = Some(Instant::now());

                let snapshot = match self.rest.depth_snapshot(&diff.symbol, SNAPSHOT_LIMIT).await {
                    Ok(snap) => snap,
                    Err(e) => {
                        // The triggering diff is dropped; the next one retries.
                        warn!(symbol = %diff.symbol, error = %e, "depth snapshot fetch failed");
                        return None;
                    }
                };

                guard.book.apply_snapshot(&snapshot);
                guard.synced = false;
                self.metrics.book_resyncs.fetch_add(1, Ordering::Relaxed);
                info!(
                    symbol = %diff.symbol,
                    last_update_id = snapshot.last_update_id,
                    "book resynchronized from snapshot"
                );

                if cold_start {
                    // The diff that triggered the bootstrap may already
                    // connect to the fresh snapshot.
                    match handle_diff(&mut guard, diff, symbol_id, &self.metrics) {
                        DiffOutcome::Applied { emitted } => emitted,
                        _ => None,
                    }
                } else {
                    // Gap recovery never applies the gapped diff.
                    None
                }
            }
        }
    }

    fn state_for(&self, symbol: &str) -> Arc<Mutex<SymbolBook>> {
        if let Some(state) = self.states.read().get(symbol) {
            return state.clone();
        }
        self.states
            .write()
            .entry(symbol.to_string())
            .or_default()
            .clone()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::DepthSnapshot;
    use crate::types::DepthLevel;

    fn snapshot(last: i64, bids: &[(f64, f64)], asks: &[(f64, f64)]) -> DepthSnapshot {
        DepthSnapshot {
            last_update_id: last,
            bids: bids.iter().map(|&(price, qty)| DepthLevel { price, qty }).collect(),
            asks: asks.iter().map(|&(price, qty)| DepthLevel { price, qty }).collect(),
        }
    }

    fn diff(first: i64, last: i64, bids: &[(f64, f64)], asks: &[(f64, f64)]) -> DepthDiffEvent {
        DepthDiffEvent {
            symbol: "BTCUSDT".to_string(),
            ts_exchange_ms: 1_700_000_000_000 + last,
            ts_ingest_ms: 1_700_000_000_001 + last,
            first_update_id: first,
            final_update_id: last,
            prev_final_update_id: Some(first - 1),
            bids: bids.iter().map(|&(price, qty)| DepthLevel { price, qty }).collect(),
            asks: asks.iter().map(|&(price, qty)| DepthLevel { price, qty }).collect(),
        }
    }

    #[test]
    fn cold_start_applies_the_triggering_diff() {
        let metrics = Metrics::new();
        let mut state = SymbolBook::default();

        let d = diff(101, 101, &[(49_999.0, 2.0)], &[]);
        assert!(matches!(
            handle_diff(&mut state, &d, 1, &metrics),
            DiffOutcome::NeedSnapshot
        ));

        state
            .book
            .apply_snapshot(&snapshot(100, &[(50_000.0, 1.0)], &[(50_001.0, 1.0)]));

        let DiffOutcome::Applied { emitted: Some(rec) } =
            handle_diff(&mut state, &d, 1, &metrics)
        else {
            panic!("expected an emitted record");
        };

        assert_eq!(rec.symbol_id, 1);
        assert_eq!(rec.bids[0], Some(BookLevel { price: 50_000.0, qty: 1.0 }));
        assert_eq!(rec.bids[1], Some(BookLevel { price: 49_999.0, qty: 2.0 }));
        assert_eq!(rec.bids[2], None);
        assert_eq!(rec.asks[0], Some(BookLevel { price: 50_001.0, qty: 1.0 }));
        assert_eq!(rec.i1, Some(0.0));
        assert!(state.synced);
    }

    #[test]
    fn gap_resets_sync_and_requests_snapshot() {
        let metrics = Metrics::new();
        let mut state = SymbolBook::default();
        state
            .book
            .apply_snapshot(&snapshot(100, &[(50_000.0, 1.0)], &[(50_001.0, 1.0)]));

        let ok = diff(101, 101, &[], &[]);
        assert!(matches!(
            handle_diff(&mut state, &ok, 1, &metrics),
            DiffOutcome::Applied { .. }
        ));
        assert!(state.synced);

        // Jump far ahead: gap detected, no emission, resync requested.
        let gapped = diff(200, 200, &[(49_000.0, 1.0)], &[]);
        assert!(matches!(
            handle_diff(&mut state, &gapped, 1, &metrics),
            DiffOutcome::NeedSnapshot
        ));
        assert!(!state.synced);
        assert_eq!(state.consecutive_gaps, 1);
        assert_eq!(metrics.book_gaps.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn stale_diffs_are_ignored() {
        let metrics = Metrics::new();
        let mut state = SymbolBook::default();
        state
            .book
            .apply_snapshot(&snapshot(100, &[(50_000.0, 1.0)], &[(50_001.0, 1.0)]));

        let stale = diff(90, 100, &[(1.0, 1.0)], &[]);
        assert!(matches!(
            handle_diff(&mut state, &stale, 1, &metrics),
            DiffOutcome::Ignored
        ));
        assert_eq!(state.book.last_update_id, Some(100));
    }

    #[test]
    fn repeated_gaps_enter_cooldown_and_resync_clears_it() {
        let metrics = Metrics::new();
        let mut state = SymbolBook::default();
        state
            .book
            .apply_snapshot(&snapshot(100, &[(50_000.0, 1.0)], &[(50_001.0, 1.0)]));

        for i in 0..GAP_COOLDOWN_THRESHOLD {
            let gapped = diff(200 + i as i64 * 10, 205 + i as i64 * 10, &[], &[]);
            assert!(matches!(
                handle_diff(&mut state, &gapped, 1, &metrics),
                DiffOutcome::NeedSnapshot
            ));
        }
        assert!(state.cooldown);

        // Resync: fresh snapshot, then a connecting diff. The completing
        // diff clears the cooldown without emitting.
        state
            .book
            .apply_snapshot(&snapshot(300, &[(50_000.0, 1.0)], &[(50_001.0, 1.0)]));
        let completing = diff(301, 301, &[], &[]);
        let DiffOutcome::Applied { emitted } = handle_diff(&mut state, &completing, 1, &metrics)
        else {
            panic!("expected Applied");
        };
        assert!(emitted.is_none());
        assert!(!state.cooldown);

        // Emission resumes on the next diff.
        let next = diff(302, 302, &[], &[]);
        let DiffOutcome::Applied { emitted } = handle_diff(&mut state, &next, 1, &metrics) else {
            panic!("expected Applied");
        };
        assert!(emitted.is_some());
    }

    #[test]
    fn snapshot_backoff_window_is_enforced() {
        let mut state = SymbolBook::default();
        assert!(state.snapshot_allowed());
        state.last_snapshot_attempt = Some(Instant::now());
        assert!(!state.snapshot_allowed());
        state.last_snapshot_attempt = Some(Instant::now() - SNAPSHOT_MIN_INTERVAL);
        assert!(state.snapshot_allowed());
    }

    #[tokio::test]
    async fn rest_failure_drops_the_event_and_stays_cold() {
        // Nothing listens on this port, so the snapshot fetch fails fast.
        let rest = FuturesRest::new("http://127.0.0.1:9");
        let metrics = Arc::new(Metrics::new());
        let builder = TopNBuilder::new(rest, metrics);

        let d = diff(101, 101, &[(49_999.0, 2.0)], &[]);
        assert!(builder.process_event(&d, 1).await.is_none());

        // State remains uninitialized and within the backoff window: the
        // immediate retry is suppressed without touching REST.
        let state = builder.state_for("BTCUSDT");
        let guard = state.lock().await;
        assert!(guard.book.last_update_id.is_none());
        assert!(!guard.snapshot_allowed());
    }
}
