// =============================================================================
// Stream Worker — one WebSocket connection per shard, with backoff reconnect
// =============================================================================
//
// The worker owns its connection for the whole shard lifetime. Decoded events
// are handed to the ingest task through a bounded channel: when the buffers
// saturate, `send().await` applies backpressure instead of dropping frames.
// Reconnects follow a fixed backoff schedule and give up after
// `MAX_RECONNECT_ATTEMPTS`, leaving the shard in `Failed` without taking the
// rest of the pipeline down.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::metrics::{ConnectionState, ShardMetrics};
use crate::stream::decoder::decode_frame;
use crate::stream::ShardConfig;
use crate::types::MarketEvent;

/// Reconnect backoff schedule in seconds; attempts beyond the end reuse the
/// last entry.
const BACKOFF_SCHEDULE: [u64; 5] = [1, 2, 5, 10, 30];

/// Attempts before the shard transitions to `Failed` and stays down.
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Dial timeout for the initial WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Backoff delay for the given reconnect attempt (1-based).
fn backoff_delay(attempt: u32) -> Duration {
    let idx = (attempt.saturating_sub(1) as usize).min(BACKOFF_SCHEDULE.len() - 1);
    Duration::from_secs(BACKOFF_SCHEDULE[idx])
}

/// Why a single connection ended.
enum ConnectionExit {
    /// Shutdown was signalled; the worker should return.
    Shutdown,
}

pub struct StreamWorker {
    shard: ShardConfig,
    ws_host: String,
    tx: mpsc::Sender<MarketEvent>,
    shutdown: watch::Receiver<bool>,
    metrics: Arc<ShardMetrics>,
}

impl StreamWorker {
    pub fn new(
        shard: ShardConfig,
        ws_host: String,
        tx: mpsc::Sender<MarketEvent>,
        shutdown: watch::Receiver<bool>,
        metrics: Arc<ShardMetrics>,
    ) -> Self {
        Self {
            shard,
            ws_host,
            tx,
            shutdown,
            metrics,
        }
    }

    /// Main loop: connect, stream, reconnect with backoff until cancelled or
    /// the attempt budget is exhausted.
    pub async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                self.metrics.set_state(ConnectionState::Disconnected);
                return;
            }

            self.metrics.set_state(if attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            });

            match self.run_connection(&mut attempt).await {
                Ok(ConnectionExit::Shutdown) => {
                    self.metrics.set_state(ConnectionState::Disconnected);
                    info!(shard = %self.metrics.label, "shard worker stopped");
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_RECONNECT_ATTEMPTS {
                        self.metrics.set_state(ConnectionState::Failed);
                        error!(
                            shard = %self.metrics.label,
                            attempts = attempt,
                            error = %e,
                            "reconnect budget exhausted, shard failed"
                        );
                        return;
                    }

                    let delay = backoff_delay(attempt);
                    self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
                    self.metrics.set_state(ConnectionState::Reconnecting);
                    warn!(
                        shard = %self.metrics.label,
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "stream error, reconnecting"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.changed() => {
                            self.metrics.set_state(ConnectionState::Disconnected);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Run a single connection until shutdown or a transport error. Resets
    /// the attempt counter once the connection is established.
    async fn run_connection(&mut self, attempt: &mut u32) -> Result<ConnectionExit> {
        let url = self.shard.stream_url(&self.ws_host);
        debug!(shard = %self.metrics.label, url = %url, "connecting to combined stream");

        let (ws_stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&url))
            .await
            .context("WebSocket connect timed out")?
            .context("failed to connect to combined stream")?;

        *attempt = 0;
        self.metrics.set_state(ConnectionState::Connected);
        info!(
            shard = %self.metrics.label,
            symbols = self.shard.symbols.len(),
            streams = self.shard.symbols.len() * self.shard.channels.len(),
            "shard connected"
        );

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(ConnectionExit::Shutdown);
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.metrics.record_message();
                            self.handle_frame(&text).await?;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(shard = %self.metrics.label, ?frame, "server closed connection");
                            anyhow::bail!("server closed connection");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(e).context("WebSocket read error");
                        }
                        None => {
                            anyhow::bail!("stream ended");
                        }
                    }
                }
            }
        }
    }

    /// Decode one frame and forward it. Send blocks when the ingest side is
    /// saturated; only a closed channel (ingest task gone) counts as a drop.
    async fn handle_frame(&mut self, text: &str) -> Result<()> {
        match decode_frame(text) {
            Ok(Some(event)) => {
                self.metrics.messages_decoded.fetch_add(1, Ordering::Relaxed);
                if self.tx.send(event).await.is_err() {
                    self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                    anyhow::bail!("ingest channel closed");
                }
            }
            Ok(None) => {
                debug!(shard = %self.metrics.label, "ignoring non-market frame");
            }
            Err(e) => {
                self.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(shard = %self.metrics.label, error = %e, "dropped malformed frame");
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_follows_canonical_schedule() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(5));
        assert_eq!(backoff_delay(4), Duration::from_secs(10));
        assert_eq!(backoff_delay(5), Duration::from_secs(30));
        // Attempts past the schedule reuse the last entry.
        assert_eq!(backoff_delay(9), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn malformed_frames_increment_parse_errors_without_aborting() {
        let (tx, _rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(ShardMetrics::new(0, "test-0", 1));

        let mut worker = StreamWorker::new(
            ShardConfig {
                shard_id: 0,
                symbols: vec!["BTCUSDT".into()],
                channels: vec![crate::types::ChannelKind::BookTicker],
            },
            "wss://example.invalid".into(),
            tx,
            shutdown_rx,
            metrics.clone(),
        );

        worker.handle_frame("not json").await.unwrap();
        worker.handle_frame("also { not json").await.unwrap();
        assert_eq!(metrics.parse_errors.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.messages_decoded.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn decoded_frames_are_forwarded() {
        let (tx, mut rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(ShardMetrics::new(0, "test-0", 1));

        let mut worker = StreamWorker::new(
            ShardConfig {
                shard_id: 0,
                symbols: vec!["BTCUSDT".into()],
                channels: vec![crate::types::ChannelKind::BookTicker],
            },
            "wss://example.invalid".into(),
            tx,
            shutdown_rx,
            metrics.clone(),
        );

        let frame = r#"{"stream":"btcusdt@bookTicker","data":{"E":1700000000000,"s":"BTCUSDT","u":1,"b":"1.0","B":"1.0","a":"2.0","A":"1.0"}}"#;
        worker.handle_frame(frame).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.symbol(), "BTCUSDT");
        assert_eq!(metrics.messages_decoded.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn closed_channel_counts_as_drop() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(ShardMetrics::new(0, "test-0", 1));

        let mut worker = StreamWorker::new(
            ShardConfig {
                shard_id: 0,
                symbols: vec!["BTCUSDT".into()],
                channels: vec![crate::types::ChannelKind::BookTicker],
            },
            "wss://example.invalid".into(),
            tx,
            shutdown_rx,
            metrics.clone(),
        );

        let frame = r#"{"stream":"btcusdt@bookTicker","data":{"E":1700000000000,"s":"BTCUSDT","u":1,"b":"1.0","B":"1.0","a":"2.0","A":"1.0"}}"#;
        assert!(worker.handle_frame(frame).await.is_err());
        assert_eq!(metrics.dropped.load(Ordering::Relaxed), 1);
    }
}
