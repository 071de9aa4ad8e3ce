// =============================================================================
// Streaming layer — shard planning, WebSocket workers, frame decoding
// =============================================================================

pub mod decoder;
pub mod planner;
pub mod worker;

use crate::types::ChannelKind;

/// Subscription scope of one WebSocket connection: a contiguous block of
/// symbols crossed with the channels of one channel class.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub shard_id: usize,
    pub symbols: Vec<String>,
    pub channels: Vec<ChannelKind>,
}

impl ShardConfig {
    /// Combined-stream names for this shard, e.g. `btcusdt@bookTicker`.
    pub fn stream_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.symbols.len() * self.channels.len());
        for symbol in &self.symbols {
            for channel in &self.channels {
                names.push(format!("{}@{}", symbol.to_lowercase(), channel.stream_suffix()));
            }
        }
        names
    }

    /// Full combined-stream URL against `ws_host`
    /// (`wss://host/stream?streams=s1@c1/s2@c2/...`).
    pub fn stream_url(&self, ws_host: &str) -> String {
        format!(
            "{}/stream?streams={}",
            ws_host.trim_end_matches('/'),
            self.stream_names().join("/")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_packs_all_subscriptions() {
        let shard = ShardConfig {
            shard_id: 0,
            symbols: vec!["BTCUSDT".into(), "ETHUSDT".into()],
            channels: vec![ChannelKind::BookTicker, ChannelKind::AggTrade],
        };
        let url = shard.stream_url("wss://fstream.binance.com");
        assert_eq!(
            url,
            "wss://fstream.binance.com/stream?streams=btcusdt@bookTicker/btcusdt@aggTrade/ethusdt@bookTicker/ethusdt@aggTrade"
        );
    }

    #[test]
    fn depth_channel_carries_rate_suffix() {
        let shard = ShardConfig {
            shard_id: 1,
            symbols: vec!["BTCUSDT".into()],
            channels: vec![ChannelKind::Depth],
        };
        assert_eq!(shard.stream_names(), vec!["btcusdt@depth@100ms"]);
    }
}
