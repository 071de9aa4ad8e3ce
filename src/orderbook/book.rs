// =============================================================================
// Book State — price-level maps and update-id sequencing for one symbol
// =============================================================================
//
// Prices are strictly positive, so their IEEE-754 bit patterns order the same
// way the values do; the maps key on `f64::to_bits` to get a total order
// without an external ordered-float dependency.
// =============================================================================

use std::collections::BTreeMap;

use crate::binance::DepthSnapshot;
use crate::types::{BookLevel, DepthDiffEvent, DepthLevel};

/// Safety cap per side. Diffs prune levels via `qty = 0` removals, but a
/// pathological stream could still grow the maps without bound; levels
/// farthest from the touch are dropped past this point, which can never
/// affect top-N output.
const MAX_LEVELS_PER_SIDE: usize = 10_000;

/// How an incoming diff relates to the current book sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffAction {
    /// No snapshot yet; the caller must bootstrap from REST.
    Bootstrap,
    /// The diff predates the book (`u <= last`); ignore it.
    Stale,
    /// The diff connects (`U <= last + 1 <= u`); apply it.
    Apply,
    /// Update ids were skipped (`U > last + 1`); resynchronize.
    Gap,
}

#[derive(Debug, Default)]
pub struct BookState {
    pub last_update_id: Option<i64>,
    bids: BTreeMap<u64, f64>,
    asks: BTreeMap<u64, f64>,
}

fn price_key(price: f64) -> u64 {
    price.to_bits()
}

impl BookState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole book with a REST snapshot.
    pub fn apply_snapshot(&mut self, snapshot: &DepthSnapshot) {
        self.bids.clear();
        self.asks.clear();
        for level in &snapshot.bids {
            if level.qty > 0.0 {
                self.bids.insert(price_key(level.price), level.qty);
            }
        }
        for level in &snapshot.asks {
            if level.qty > 0.0 {
                self.asks.insert(price_key(level.price), level.qty);
            }
        }
        self.last_update_id = Some(snapshot.last_update_id);
    }

    /// Classify a diff against the current sequence position.
    pub fn classify(&self, first_update_id: i64, final_update_id: i64) -> DiffAction {
        let Some(last) = self.last_update_id else {
            return DiffAction::Bootstrap;
        };
        if final_update_id <= last {
            DiffAction::Stale
        } else if first_update_id <= last + 1 {
            DiffAction::Apply
        } else {
            DiffAction::Gap
        }
    }

    /// Apply a connecting diff and advance `last_update_id`. The caller is
    /// responsible for classifying first; applying a gapped diff corrupts
    /// the book.
    pub fn apply_diff(&mut self, diff: &DepthDiffEvent) {
        apply_side(&mut self.bids, &diff.bids);
        apply_side(&mut self.asks, &diff.asks);
        self.last_update_id = Some(diff.final_update_id);
        self.enforce_depth_cap();
    }

    /// Best N levels per side with positive quantity: bids descending,
    /// asks ascending.
    pub fn top_levels(&self, n: usize) -> (Vec<BookLevel>, Vec<BookLevel>) {
        let bids = self
            .bids
            .iter()
            .rev()
            .filter(|(_, qty)| **qty > 0.0)
            .take(n)
            .map(|(bits, qty)| BookLevel {
                price: f64::from_bits(*bits),
                qty: *qty,
            })
            .collect();
        let asks = self
            .asks
            .iter()
            .filter(|(_, qty)| **qty > 0.0)
            .take(n)
            .map(|(bits, qty)| BookLevel {
                price: f64::from_bits(*bits),
                qty: *qty,
            })
            .collect();
        (bids, asks)
    }

    /// A synced book should never cross; crossed state is applied verbatim
    /// and flagged by the caller.
    pub fn is_crossed(&self) -> bool {
        match (self.bids.keys().next_back(), self.asks.keys().next()) {
            (Some(best_bid), Some(best_ask)) => {
                f64::from_bits(*best_bid) >= f64::from_bits(*best_ask)
            }
            _ => false,
        }
    }

    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    fn enforce_depth_cap(&mut self) {
        // Bids: keep the highest prices, drop from the low end.
        while self.bids.len() > MAX_LEVELS_PER_SIDE {
            let key = *self.bids.keys().next().unwrap();
            self.bids.remove(&key);
        }
        // Asks: keep the lowest prices, drop from the high end.
        while self.asks.len() > MAX_LEVELS_PER_SIDE {
            let key = *self.asks.keys().next_back().unwrap();
            self.asks.remove(&key);
        }
    }
}

fn apply_side(side: &mut BTreeMap<u64, f64>, levels: &[DepthLevel]) {
    for level in levels {
        if level.qty == 0.0 {
            // Removing an absent price is a no-op.
            side.remove(&price_key(level.price));
        } else {
            side.insert(price_key(level.price), level.qty);
        }
    }
}
