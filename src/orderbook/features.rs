// =============================================================================
// Microstructure Features — derived from the reconstructed top-5 levels
// =============================================================================

use crate::types::BookLevel;

/// Feature set attached to every top-5 snapshot. All fields are `None` when
/// either side of the book is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BookFeatures {
    pub microprice: Option<f64>,
    pub i1: Option<f64>,
    pub i5: Option<f64>,
    pub wall_size_bid: Option<f64>,
    pub wall_size_ask: Option<f64>,
    pub wall_dist_bid_bps: Option<f64>,
    pub wall_dist_ask_bps: Option<f64>,
}

/// Compute features from the top levels (bids descending, asks ascending).
pub fn compute(bids: &[BookLevel], asks: &[BookLevel]) -> BookFeatures {
    let (Some(b1), Some(a1)) = (bids.first(), asks.first()) else {
        return BookFeatures::default();
    };

    let mid = (b1.price + a1.price) / 2.0;
    let touch_qty = b1.qty + a1.qty;

    // Quantity-weighted midpoint; plain midpoint when the touch is empty.
    let microprice = if touch_qty > 0.0 {
        (b1.price * a1.qty + a1.price * b1.qty) / touch_qty
    } else {
        mid
    };

    let i1 = if touch_qty > 0.0 {
        (b1.qty - a1.qty) / touch_qty
    } else {
        0.0
    };

    let bid_sum: f64 = bids.iter().map(|l| l.qty).sum();
    let ask_sum: f64 = asks.iter().map(|l| l.qty).sum();
    let i5 = if bid_sum + ask_sum > 0.0 {
        (bid_sum - ask_sum) / (bid_sum + ask_sum)
    } else {
        0.0
    };

    let (wall_bid_price, wall_size_bid) = wall(bids).unwrap_or((b1.price, 0.0));
    let (wall_ask_price, wall_size_ask) = wall(asks).unwrap_or((a1.price, 0.0));

    let dist_bps = |price: f64| {
        if mid > 0.0 {
            Some((price - mid).abs() / mid * 10_000.0)
        } else {
            None
        }
    };

    BookFeatures {
        microprice: Some(microprice),
        i1: Some(i1),
        i5: Some(i5),
        wall_size_bid: Some(wall_size_bid),
        wall_size_ask: Some(wall_size_ask),
        wall_dist_bid_bps: dist_bps(wall_bid_price),
        wall_dist_ask_bps: dist_bps(wall_ask_price),
    }
}

/// Price and size of the largest level on one side.
fn wall(levels: &[BookLevel]) -> Option<(f64, f64)> {
    levels
        .iter()
        .max_by(|a, b| a.qty.partial_cmp(&b.qty).unwrap_or(std::cmp::Ordering::Equal))
        .map(|l| (l.price, l.qty))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: f64, qty: f64) -> BookLevel {
        BookLevel { price, qty }
    }

    #[test]
    fn microprice_weights_toward_the_thinner_side() {
        // b1 = 100 @ 1, a1 = 102 @ 3: microprice pulls toward the bid.
        let f = compute(&[level(100.0, 1.0)], &[level(102.0, 3.0)]);
        let expected = (100.0 * 3.0 + 102.0 * 1.0) / 4.0;
        assert!((f.microprice.unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn balanced_touch_gives_zero_imbalance() {
        let f = compute(&[level(50_000.0, 1.0)], &[level(50_001.0, 1.0)]);
        assert_eq!(f.i1, Some(0.0));
        assert!((f.microprice.unwrap() - 50_000.5).abs() < 1e-9);
    }

    #[test]
    fn empty_touch_falls_back_to_midpoint() {
        let f = compute(&[level(100.0, 0.0)], &[level(102.0, 0.0)]);
        assert_eq!(f.microprice, Some(101.0));
        assert_eq!(f.i1, Some(0.0));
        assert_eq!(f.i5, Some(0.0));
    }

    #[test]
    fn i5_sums_over_all_levels() {
        let bids = vec![level(100.0, 2.0), level(99.0, 2.0)];
        let asks = vec![level(101.0, 1.0), level(102.0, 1.0)];
        let f = compute(&bids, &asks);
        // (4 - 2) / (4 + 2)
        assert!((f.i5.unwrap() - 2.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn wall_metrics_locate_the_largest_level() {
        let bids = vec![level(100.0, 1.0), level(99.0, 10.0)];
        let asks = vec![level(101.0, 5.0), level(102.0, 2.0)];
        let f = compute(&bids, &asks);

        assert_eq!(f.wall_size_bid, Some(10.0));
        assert_eq!(f.wall_size_ask, Some(5.0));

        let mid = 100.5;
        let expected_bid_dist = (99.0f64 - mid).abs() / mid * 10_000.0;
        let expected_ask_dist = (101.0f64 - mid).abs() / mid * 10_000.0;
        assert!((f.wall_dist_bid_bps.unwrap() - expected_bid_dist).abs() < 1e-9);
        assert!((f.wall_dist_ask_bps.unwrap() - expected_ask_dist).abs() < 1e-9);
    }

    #[test]
    fn one_sided_book_yields_no_features() {
        assert_eq!(compute(&[level(100.0, 1.0)], &[]), BookFeatures::default());
        assert_eq!(compute(&[], &[level(101.0, 1.0)]), BookFeatures::default());
        assert_eq!(compute(&[], &[]), BookFeatures::default());
    }
}
