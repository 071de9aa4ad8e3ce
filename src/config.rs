// =============================================================================
// Collector Configuration — environment-driven settings
// =============================================================================
//
// Every deployment knob is read from the environment (a `.env` file is loaded
// by main before this runs). Missing optional variables fall back to the
// defaults below; a missing DATABASE_URL is fatal unless DRY_RUN is active.
// =============================================================================

use anyhow::{bail, Result};
use tracing::warn;

use crate::types::ChannelKind;

/// Default WebSocket host for Binance USDT-margined futures.
pub const DEFAULT_WS_URL: &str = "wss://fstream.binance.com";

/// Default REST host for snapshots and exchange info.
pub const DEFAULT_BASE_URL: &str = "https://fapi.binance.com";

/// Symbols collected when the `SYMBOLS` variable is not set.
const DEFAULT_SYMBOLS: &[&str] = &[
    "BTCUSDT", "ETHUSDT", "BNBUSDT", "ADAUSDT", "SOLUSDT", "XRPUSDT", "DOTUSDT",
    "DOGEUSDT", "AVAXUSDT", "MATICUSDT", "SHIBUSDT", "LTCUSDT", "TRXUSDT",
    "UNIUSDT", "LINKUSDT", "BCHUSDT", "XLMUSDT", "ATOMUSDT", "ETCUSDT",
    "FILUSDT", "VETUSDT", "ICPUSDT", "FTMUSDT", "HBARUSDT", "ALGOUSDT",
    "THETAUSDT", "EOSUSDT", "AAVEUSDT", "MKRUSDT", "AXSUSDT", "SANDUSDT",
    "MANAUSDT", "IOTAUSDT", "NEARUSDT", "APTUSDT", "ARBUSDT", "OPUSDT",
    "INJUSDT", "SUIUSDT", "SEIUSDT",
];

fn default_channels() -> Vec<ChannelKind> {
    vec![ChannelKind::BookTicker, ChannelKind::AggTrade]
}

/// Runtime configuration for the collector process.
#[derive(Debug, Clone)]
pub struct Config {
    // --- Store -------------------------------------------------------------
    /// Postgres DSN. May be empty only in dry-run mode.
    pub database_url: String,
    /// `disable` | `require` | `verify-ca` | `verify-full` (DSN value wins
    /// if both are present).
    pub db_sslmode: Option<String>,
    /// Path to a CA root certificate for `verify-*` modes.
    pub db_sslrootcert: Option<String>,

    // --- Exchange endpoints ------------------------------------------------
    pub ws_url: String,
    pub base_url: String,

    // --- Universe ----------------------------------------------------------
    /// Candidate symbols before exchangeInfo filtering.
    pub symbols: Vec<String>,
    /// Hard cap applied after filtering.
    pub total_symbols: Option<usize>,
    /// Symbol rotated to the front of the universe.
    pub starting_symbol: Option<String>,

    // --- Streams -----------------------------------------------------------
    /// Channels for the main shard group.
    pub channels: Vec<ChannelKind>,
    /// Shard count for the main group.
    pub shards: usize,
    pub enable_depth: bool,
    /// Depth scope override; first 10 universe symbols when empty.
    pub depth_top_symbols: Vec<String>,
    pub enable_mark_price: bool,
    pub enable_force_order: bool,

    // --- Buffers -----------------------------------------------------------
    /// Overrides every table's flush size when set.
    pub batch_size: Option<usize>,
    /// Overrides every table's flush age (seconds) when set.
    pub flush_interval_secs: Option<u64>,

    // --- Persistence -------------------------------------------------------
    /// Buffers still fill and drain, writes become logged no-ops.
    pub dry_run: bool,

    // --- Watchdog ----------------------------------------------------------
    pub enable_db_watchdog: bool,
    pub db_watchdog_interval_secs: u64,
    pub db_watchdog_threshold_secs: u64,

    // --- Monitoring --------------------------------------------------------
    pub monitoring_port: u16,
}

impl Config {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let dry_run = parse_bool(get("DRY_RUN").as_deref(), false);

        let database_url = match get("DATABASE_URL") {
            Some(url) if !url.trim().is_empty() => url.trim().to_string(),
            _ if dry_run => String::new(),
            _ => bail!("DATABASE_URL environment variable is required"),
        };

        let symbols = match get("SYMBOLS") {
            Some(raw) => parse_symbol_list(&raw),
            None => DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect(),
        };
        if symbols.is_empty() {
            bail!("SYMBOLS resolved to an empty list");
        }

        let channels = match get("CHANNELS") {
            Some(raw) => {
                let parsed: Vec<ChannelKind> = raw
                    .split(',')
                    .filter(|s| !s.trim().is_empty())
                    .filter_map(|s| {
                        let ch = ChannelKind::parse(s);
                        if ch.is_none() {
                            warn!(channel = %s.trim(), "unknown channel in CHANNELS, skipping");
                        }
                        ch
                    })
                    .collect();
                if parsed.is_empty() {
                    default_channels()
                } else {
                    parsed
                }
            }
            None => default_channels(),
        };

        Ok(Self {
            database_url,
            db_sslmode: get("DB_SSLMODE").filter(|s| !s.trim().is_empty()),
            db_sslrootcert: get("DB_SSLROOTCERT").filter(|s| !s.trim().is_empty()),
            ws_url: get("BINANCE_WS_URL")
                .filter(|s| !s.trim().is_empty())
                .map(|s| normalize_host(&s))
                .unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
            base_url: get("BINANCE_BASE_URL")
                .filter(|s| !s.trim().is_empty())
                .map(|s| normalize_host(&s))
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            symbols,
            total_symbols: parse_opt(get("TOTAL_SYMBOLS").as_deref()),
            starting_symbol: get("STARTING_SYMBOL")
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty()),
            channels,
            shards: parse_opt(get("SHARDS").as_deref()).unwrap_or(5).max(1),
            enable_depth: parse_bool(get("ENABLE_DEPTH").as_deref(), false),
            depth_top_symbols: get("DEPTH_TOP_SYMBOLS")
                .map(|raw| parse_symbol_list(&raw))
                .unwrap_or_default(),
            enable_mark_price: parse_bool(get("ENABLE_MARK_PRICE").as_deref(), false),
            enable_force_order: parse_bool(get("ENABLE_FORCE_ORDER").as_deref(), false),
            batch_size: parse_opt(get("BATCH_SIZE").as_deref()),
            flush_interval_secs: parse_opt(get("FLUSH_INTERVAL").as_deref()),
            dry_run,
            enable_db_watchdog: parse_bool(get("ENABLE_DB_WATCHDOG").as_deref(), true),
            db_watchdog_interval_secs: parse_opt(get("DB_WATCHDOG_INTERVAL").as_deref())
                .unwrap_or(60),
            db_watchdog_threshold_secs: parse_opt(get("DB_WATCHDOG_THRESHOLD").as_deref())
                .unwrap_or(120),
            monitoring_port: parse_opt(get("MONITORING_PORT").as_deref()).unwrap_or(8000),
        })
    }

    /// Order the universe so `starting_symbol` comes first: the list is
    /// rotated at its index, the remainder keeps the original order.
    pub fn rotate_universe(&self, mut symbols: Vec<String>) -> Vec<String> {
        if let Some(start) = &self.starting_symbol {
            if let Some(idx) = symbols.iter().position(|s| s == start) {
                symbols.rotate_left(idx);
            } else {
                warn!(symbol = %start, "STARTING_SYMBOL not in universe, keeping original order");
            }
        }
        if let Some(cap) = self.total_symbols {
            symbols.truncate(cap);
        }
        symbols
    }
}

// =============================================================================
// Parsing helpers
// =============================================================================

fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value {
        Some(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"),
        None => default,
    }
}

fn parse_opt<T: std::str::FromStr>(value: Option<&str>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Strip trailing slashes and legacy `/ws/` path segments from endpoint
/// hosts so URL construction can always append its own path.
fn normalize_host(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    trimmed.trim_end_matches("/ws").to_string()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn missing_database_url_is_fatal() {
        assert!(config_from(&[]).is_err());
    }

    #[test]
    fn dry_run_allows_missing_database_url() {
        let cfg = config_from(&[("DRY_RUN", "true")]).unwrap();
        assert!(cfg.dry_run);
        assert!(cfg.database_url.is_empty());
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = config_from(&[("DATABASE_URL", "postgres://localhost/marketdata")]).unwrap();
        assert_eq!(cfg.ws_url, DEFAULT_WS_URL);
        assert_eq!(cfg.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.shards, 5);
        assert_eq!(cfg.channels, vec![ChannelKind::BookTicker, ChannelKind::AggTrade]);
        assert!(!cfg.enable_depth);
        assert!(cfg.enable_db_watchdog);
        assert_eq!(cfg.db_watchdog_interval_secs, 60);
        assert_eq!(cfg.db_watchdog_threshold_secs, 120);
        assert_eq!(cfg.symbols.len(), DEFAULT_SYMBOLS.len());
    }

    #[test]
    fn symbol_and_channel_lists_are_parsed() {
        let cfg = config_from(&[
            ("DATABASE_URL", "postgres://localhost/marketdata"),
            ("SYMBOLS", "btcusdt, ethusdt,,SOLUSDT "),
            ("CHANNELS", "bookTicker,depth@100ms,bogus"),
        ])
        .unwrap();
        assert_eq!(cfg.symbols, vec!["BTCUSDT", "ETHUSDT", "SOLUSDT"]);
        assert_eq!(cfg.channels, vec![ChannelKind::BookTicker, ChannelKind::Depth]);
    }

    #[test]
    fn legacy_ws_path_is_normalized() {
        let cfg = config_from(&[
            ("DATABASE_URL", "postgres://localhost/marketdata"),
            ("BINANCE_WS_URL", "wss://fstream.binance.com/ws/"),
        ])
        .unwrap();
        assert_eq!(cfg.ws_url, "wss://fstream.binance.com");
    }

    #[test]
    fn universe_rotation_and_cap() {
        let cfg = config_from(&[
            ("DATABASE_URL", "postgres://localhost/marketdata"),
            ("STARTING_SYMBOL", "solusdt"),
            ("TOTAL_SYMBOLS", "3"),
        ])
        .unwrap();
        let rotated = cfg.rotate_universe(vec![
            "BTCUSDT".into(),
            "ETHUSDT".into(),
            "SOLUSDT".into(),
            "XRPUSDT".into(),
        ]);
        assert_eq!(rotated, vec!["SOLUSDT", "XRPUSDT", "BTCUSDT"]);
    }

    #[test]
    fn rotation_with_unknown_start_keeps_order() {
        let cfg = config_from(&[
            ("DATABASE_URL", "postgres://localhost/marketdata"),
            ("STARTING_SYMBOL", "ZZZUSDT"),
        ])
        .unwrap();
        let rotated = cfg.rotate_universe(vec!["BTCUSDT".into(), "ETHUSDT".into()]);
        assert_eq!(rotated, vec!["BTCUSDT", "ETHUSDT"]);
    }
}
