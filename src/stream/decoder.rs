// =============================================================================
// Frame Decoder — combined-stream JSON envelopes into typed market events
// =============================================================================
//
// Every frame is `{"stream": "<sym>@<channel>", "data": {...}}`. Dispatch is
// on the stream suffix; field names are exchange-defined and mapped verbatim.
// Unknown suffixes decode to `None` (debug-logged by the worker); malformed
// payloads are errors so the worker can count them.
// =============================================================================

use anyhow::{Context, Result};
use serde_json::Value;

use crate::types::{
    now_ms, BookTickerEvent, DepthDiffEvent, DepthLevel, ForceOrderEvent, MarkPriceEvent,
    MarketEvent, TradeEvent,
};

/// Decode one WebSocket text frame.
///
/// Returns `Ok(None)` for control messages (subscription acks carry `result`
/// or `id`) and for stream suffixes the collector does not persist.
pub fn decode_frame(text: &str) -> Result<Option<MarketEvent>> {
    let root: Value = serde_json::from_str(text).context("frame is not valid JSON")?;

    // Subscription acks and pong responses are not market data.
    if root.get("result").is_some() || root.get("id").is_some() {
        return Ok(None);
    }

    let stream = match root.get("stream").and_then(|v| v.as_str()) {
        Some(s) => s,
        None => return Ok(None),
    };
    let data = root.get("data").context("frame missing 'data' payload")?;

    let ts_ingest_ms = now_ms();

    if stream.contains("@bookTicker") {
        decode_book_ticker(data, ts_ingest_ms).map(|e| Some(MarketEvent::BookTicker(e)))
    } else if stream.contains("@aggTrade") {
        decode_agg_trade(data, ts_ingest_ms).map(|e| Some(MarketEvent::Trade(e)))
    } else if stream.contains("@depth") {
        decode_depth(data, ts_ingest_ms).map(|e| Some(MarketEvent::DepthDiff(e)))
    } else if stream.contains("@markPrice") {
        decode_mark_price(data, ts_ingest_ms).map(|e| Some(MarketEvent::MarkPrice(e)))
    } else if stream.contains("@forceOrder") {
        decode_force_order(data, ts_ingest_ms).map(|e| Some(MarketEvent::ForceOrder(e)))
    } else {
        Ok(None)
    }
}

// =============================================================================
// Per-channel decoders
// =============================================================================

fn decode_book_ticker(data: &Value, ts_ingest_ms: i64) -> Result<BookTickerEvent> {
    Ok(BookTickerEvent {
        symbol: req_str(data, "s")?.to_uppercase(),
        ts_exchange_ms: req_i64(data, "E")?,
        ts_ingest_ms,
        update_id: data["u"].as_i64(),
        best_bid: req_price(data, "b")?,
        best_ask: req_price(data, "a")?,
        bid_qty: req_price(data, "B")?,
        ask_qty: req_price(data, "A")?,
    })
}

fn decode_agg_trade(data: &Value, ts_ingest_ms: i64) -> Result<TradeEvent> {
    Ok(TradeEvent {
        symbol: req_str(data, "s")?.to_uppercase(),
        ts_exchange_ms: req_i64(data, "E")?,
        ts_ingest_ms,
        agg_trade_id: req_i64(data, "a")?,
        price: req_price(data, "p")?,
        qty: req_price(data, "q")?,
        is_buyer_maker: data["m"].as_bool().context("missing field m")?,
    })
}

fn decode_depth(data: &Value, ts_ingest_ms: i64) -> Result<DepthDiffEvent> {
    Ok(DepthDiffEvent {
        symbol: req_str(data, "s")?.to_uppercase(),
        ts_exchange_ms: req_i64(data, "E")?,
        ts_ingest_ms,
        first_update_id: req_i64(data, "U")?,
        final_update_id: req_i64(data, "u")?,
        prev_final_update_id: data["pu"].as_i64(),
        bids: decode_levels(&data["b"]).context("invalid bid levels")?,
        asks: decode_levels(&data["a"]).context("invalid ask levels")?,
    })
}

fn decode_mark_price(data: &Value, ts_ingest_ms: i64) -> Result<MarkPriceEvent> {
    Ok(MarkPriceEvent {
        symbol: req_str(data, "s")?.to_uppercase(),
        ts_exchange_ms: data["E"].as_i64().unwrap_or(0),
        ts_ingest_ms,
        event_type: data["e"].as_str().map(str::to_string),
        mark_price: opt_price(data, "p"),
        index_price: opt_price(data, "i"),
        est_settlement_price: opt_price(data, "P"),
        funding_rate: opt_price(data, "r"),
        next_funding_time_ms: data["T"].as_i64(),
    })
}

fn decode_force_order(data: &Value, ts_ingest_ms: i64) -> Result<ForceOrderEvent> {
    // The order payload is nested under 'o'; the outer envelope only carries
    // the event type and time.
    let order = data.get("o").context("forceOrder missing 'o' payload")?;
    let symbol = order["s"]
        .as_str()
        .or_else(|| data["s"].as_str())
        .context("forceOrder missing symbol")?
        .to_uppercase();
    let ts_exchange_ms = data["E"].as_i64().or_else(|| order["T"].as_i64()).unwrap_or(0);

    Ok(ForceOrderEvent {
        symbol,
        ts_exchange_ms,
        ts_ingest_ms,
        side: order["S"].as_str().map(str::to_string),
        price: opt_price(order, "p"),
        qty: opt_price(order, "q"),
        raw: data.clone(),
    })
}

// =============================================================================
// Field helpers
// =============================================================================

fn req_str<'a>(data: &'a Value, field: &'static str) -> Result<&'a str> {
    data[field]
        .as_str()
        .with_context(|| format!("missing field {field}"))
}

fn req_i64(data: &Value, field: &'static str) -> Result<i64> {
    data[field]
        .as_i64()
        .with_context(|| format!("missing field {field}"))
}

/// Binance encodes prices and quantities as decimal strings.
fn req_price(data: &Value, field: &'static str) -> Result<f64> {
    data[field]
        .as_str()
        .with_context(|| format!("missing field {field}"))?
        .parse()
        .with_context(|| format!("failed to parse field {field}"))
}

fn opt_price(data: &Value, field: &str) -> Option<f64> {
    data[field].as_str().and_then(|s| s.parse().ok())
}

fn decode_levels(side: &Value) -> Result<Vec<DepthLevel>> {
    let Some(entries) = side.as_array() else {
        // A missing side is an empty diff for that side, not an error.
        return Ok(Vec::new());
    };

    let mut levels = Vec::with_capacity(entries.len());
    for entry in entries {
        let pair = entry.as_array().context("level is not a [price, qty] pair")?;
        let price: f64 = pair
            .first()
            .and_then(|v| v.as_str())
            .context("level missing price")?
            .parse()
            .context("failed to parse level price")?;
        let qty: f64 = pair
            .get(1)
            .and_then(|v| v.as_str())
            .context("level missing qty")?
            .parse()
            .context("failed to parse level qty")?;
        levels.push(DepthLevel { price, qty });
    }
    Ok(levels)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_book_ticker_frame() {
        let frame = r#"{"stream":"btcusdt@bookTicker","data":{"e":"bookTicker","E":1700000000000,"s":"BTCUSDT","u":42,"b":"50000.0","B":"1.0","a":"50001.0","A":"2.0"}}"#;
        let event = decode_frame(frame).unwrap().unwrap();
        let MarketEvent::BookTicker(e) = event else {
            panic!("expected BookTicker");
        };
        assert_eq!(e.symbol, "BTCUSDT");
        assert_eq!(e.ts_exchange_ms, 1_700_000_000_000);
        assert_eq!(e.update_id, Some(42));
        assert!((e.best_bid - 50_000.0).abs() < f64::EPSILON);
        assert!((e.best_ask - 50_001.0).abs() < f64::EPSILON);
        assert!((e.spread() - 1.0).abs() < f64::EPSILON);
        assert!((e.mid() - 50_000.5).abs() < f64::EPSILON);
    }

    #[test]
    fn decodes_agg_trade_frame() {
        let frame = r#"{"stream":"btcusdt@aggTrade","data":{"e":"aggTrade","E":1700000000123,"s":"BTCUSDT","a":7,"p":"50000","q":"0.1","m":true}}"#;
        let event = decode_frame(frame).unwrap().unwrap();
        let MarketEvent::Trade(e) = event else {
            panic!("expected Trade");
        };
        assert_eq!(e.agg_trade_id, 7);
        assert!((e.price - 50_000.0).abs() < f64::EPSILON);
        assert!(e.is_buyer_maker);
    }

    #[test]
    fn decodes_depth_frame_with_empty_side() {
        let frame = r#"{"stream":"btcusdt@depth@100ms","data":{"e":"depthUpdate","E":1700000000200,"s":"BTCUSDT","U":101,"u":101,"pu":100,"b":[["49999","2.0"],["49998","0"]],"a":[]}}"#;
        let event = decode_frame(frame).unwrap().unwrap();
        let MarketEvent::DepthDiff(e) = event else {
            panic!("expected DepthDiff");
        };
        assert_eq!(e.first_update_id, 101);
        assert_eq!(e.final_update_id, 101);
        assert_eq!(e.prev_final_update_id, Some(100));
        assert_eq!(e.bids.len(), 2);
        assert!((e.bids[1].qty - 0.0).abs() < f64::EPSILON);
        assert!(e.asks.is_empty());
    }

    #[test]
    fn decodes_mark_price_with_missing_optionals() {
        let frame = r#"{"stream":"btcusdt@markPrice@1s","data":{"e":"markPriceUpdate","E":1700000000300,"s":"BTCUSDT","p":"50000.5","r":"0.0001","T":1700028800000}}"#;
        let event = decode_frame(frame).unwrap().unwrap();
        let MarketEvent::MarkPrice(e) = event else {
            panic!("expected MarkPrice");
        };
        assert_eq!(e.mark_price, Some(50_000.5));
        assert_eq!(e.index_price, None);
        assert_eq!(e.funding_rate, Some(0.0001));
        assert_eq!(e.next_funding_time_ms, Some(1_700_028_800_000));
    }

    #[test]
    fn decodes_force_order_from_nested_payload() {
        let frame = r#"{"stream":"btcusdt@forceOrder","data":{"e":"forceOrder","E":1700000000400,"o":{"s":"BTCUSDT","S":"SELL","p":"49000","q":"0.5","T":1700000000399}}}"#;
        let event = decode_frame(frame).unwrap().unwrap();
        let MarketEvent::ForceOrder(e) = event else {
            panic!("expected ForceOrder");
        };
        assert_eq!(e.symbol, "BTCUSDT");
        assert_eq!(e.side.as_deref(), Some("SELL"));
        assert_eq!(e.price, Some(49_000.0));
        assert_eq!(e.ts_exchange_ms, 1_700_000_000_400);
        assert!(e.raw.get("o").is_some());
    }

    #[test]
    fn control_and_unknown_frames_are_skipped() {
        assert!(decode_frame(r#"{"result":null,"id":1}"#).unwrap().is_none());
        assert!(decode_frame(r#"{"stream":"btcusdt@kline_1m","data":{}}"#)
            .unwrap()
            .is_none());
        assert!(decode_frame(r#"{"no_stream":true}"#).unwrap().is_none());
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(decode_frame("not json").is_err());
        // bookTicker without prices.
        assert!(
            decode_frame(r#"{"stream":"btcusdt@bookTicker","data":{"s":"BTCUSDT","E":1}}"#)
                .is_err()
        );
    }
}
