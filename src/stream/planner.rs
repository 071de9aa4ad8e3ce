// =============================================================================
// Shard Planner — partitions the symbol universe across WebSocket connections
// =============================================================================
//
// Symbols are block-partitioned contiguously; the last shard absorbs the
// remainder. The supervisor calls `plan` once per channel class so that
// high-rate depth subscriptions never share a connection with the slower
// ticker/trade streams.
// =============================================================================

use crate::stream::ShardConfig;
use crate::types::ChannelKind;

/// Partition `symbols` into at most `shard_count` shards, each subscribed to
/// every channel in `channels`. Empty shards are never emitted; `base_id`
/// offsets the shard ids so that several plans can coexist in one process.
pub fn plan(
    symbols: &[String],
    channels: &[ChannelKind],
    shard_count: usize,
    base_id: usize,
) -> Vec<ShardConfig> {
    if symbols.is_empty() || channels.is_empty() {
        return Vec::new();
    }

    let shard_count = shard_count.clamp(1, symbols.len());
    let per_shard = symbols.len() / shard_count;

    let mut configs = Vec::with_capacity(shard_count);
    for shard_idx in 0..shard_count {
        let start = shard_idx * per_shard;
        // The last shard takes the remainder.
        let end = if shard_idx == shard_count - 1 {
            symbols.len()
        } else {
            (shard_idx + 1) * per_shard
        };

        let shard_symbols: Vec<String> = symbols[start..end].to_vec();
        if shard_symbols.is_empty() {
            continue;
        }

        configs.push(ShardConfig {
            shard_id: base_id + shard_idx,
            symbols: shard_symbols,
            channels: channels.to_vec(),
        });
    }

    configs
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn symbols(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("SYM{i}USDT")).collect()
    }

    #[test]
    fn partitions_are_contiguous_and_cover_everything() {
        let syms = symbols(11);
        let shards = plan(&syms, &[ChannelKind::BookTicker], 3, 0);

        assert_eq!(shards.len(), 3);
        assert_eq!(shards[0].symbols.len(), 3);
        assert_eq!(shards[1].symbols.len(), 3);
        // Last shard absorbs the remainder.
        assert_eq!(shards[2].symbols.len(), 5);

        let flattened: Vec<String> = shards.iter().flat_map(|s| s.symbols.clone()).collect();
        assert_eq!(flattened, syms);
    }

    #[test]
    fn shard_count_is_clamped_to_symbol_count() {
        let syms = symbols(2);
        let shards = plan(&syms, &[ChannelKind::AggTrade], 8, 0);
        assert_eq!(shards.len(), 2);
        assert!(shards.iter().all(|s| s.symbols.len() == 1));
    }

    #[test]
    fn base_id_offsets_shard_ids() {
        let syms = symbols(4);
        let shards = plan(&syms, &[ChannelKind::Depth], 2, 10);
        assert_eq!(shards[0].shard_id, 10);
        assert_eq!(shards[1].shard_id, 11);
    }

    #[test]
    fn empty_inputs_produce_no_shards() {
        assert!(plan(&[], &[ChannelKind::BookTicker], 3, 0).is_empty());
        assert!(plan(&symbols(3), &[], 3, 0).is_empty());
    }

    #[test]
    fn every_shard_carries_the_full_channel_class() {
        let syms = symbols(6);
        let channels = [ChannelKind::BookTicker, ChannelKind::AggTrade];
        let shards = plan(&syms, &channels, 2, 0);
        for shard in &shards {
            assert_eq!(shard.channels, channels.to_vec());
        }
    }
}
