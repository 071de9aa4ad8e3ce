// =============================================================================
// Binance Futures REST Client — public endpoints only
// =============================================================================
//
// The collector never trades, so nothing here is signed. Two endpoints are
// used: `/fapi/v1/depth` for order-book resynchronization and
// `/fapi/v1/exchangeInfo` for resolving the tradable USDT-perp universe at
// startup.
// =============================================================================

use std::collections::HashSet;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::types::DepthLevel;

/// Full order-book snapshot from `GET /fapi/v1/depth`.
#[derive(Debug, Clone)]
pub struct DepthSnapshot {
    pub last_update_id: i64,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

/// REST client for the Binance USDT-margined futures API.
#[derive(Clone)]
pub struct FuturesRest {
    base_url: String,
    client: reqwest::Client,
}

impl FuturesRest {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// GET /fapi/v1/depth — order-book snapshot used by the reconstructor's
    /// resync path.
    #[instrument(skip(self), name = "binance::depth_snapshot")]
    pub async fn depth_snapshot(&self, symbol: &str, limit: u32) -> Result<DepthSnapshot> {
        let url = format!(
            "{}/fapi/v1/depth?symbol={}&limit={}",
            self.base_url, symbol, limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/depth request failed")?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .context("failed to parse depth snapshot response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /fapi/v1/depth returned {}: {}", status, body);
        }

        let snapshot = parse_depth_snapshot(&body)?;
        debug!(
            symbol,
            last_update_id = snapshot.last_update_id,
            bids = snapshot.bids.len(),
            asks = snapshot.asks.len(),
            "depth snapshot fetched"
        );
        Ok(snapshot)
    }

    /// GET /fapi/v1/exchangeInfo — the set of symbols the collector may
    /// subscribe to: TRADING perpetual/quarterly contracts quoted in USDT.
    #[instrument(skip(self), name = "binance::exchange_info")]
    pub async fn tradable_usdt_symbols(&self) -> Result<HashSet<String>> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/exchangeInfo request failed")?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .context("failed to parse exchangeInfo response")?;

        if !status.is_success() {
            anyhow::bail!(
                "Binance GET /fapi/v1/exchangeInfo returned {}: {}",
                status,
                body
            );
        }

        let symbols = parse_exchange_info(&body);
        debug!(count = symbols.len(), "tradable USDT symbols resolved");
        Ok(symbols)
    }
}

impl std::fmt::Debug for FuturesRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuturesRest")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Response parsing
// =============================================================================

fn parse_depth_snapshot(body: &Value) -> Result<DepthSnapshot> {
    let last_update_id = body["lastUpdateId"]
        .as_i64()
        .context("depth snapshot missing lastUpdateId")?;

    Ok(DepthSnapshot {
        last_update_id,
        bids: parse_snapshot_side(&body["bids"]).context("invalid snapshot bids")?,
        asks: parse_snapshot_side(&body["asks"]).context("invalid snapshot asks")?,
    })
}

fn parse_snapshot_side(side: &Value) -> Result<Vec<DepthLevel>> {
    let Some(entries) = side.as_array() else {
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

fn parse_exchange_info(body: &Value) -> HashSet<String> {
    body["symbols"]
        .as_array()
        .map(|symbols| {
            symbols
                .iter()
                .filter(|s| {
                    matches!(
                        s["contractType"].as_str(),
                        Some("PERPETUAL") | Some("CURRENT_QUARTER") | Some("NEXT_QUARTER")
                    ) && s["status"].as_str() == Some("TRADING")
                        && s["quoteAsset"].as_str() == Some("USDT")
                })
                .filter_map(|s| s["symbol"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
