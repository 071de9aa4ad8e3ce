// =============================================================================
// DB Watchdog — cancels runaway statements before they exhaust the pool
// =============================================================================
//
// Periodically scans pg_stat_activity for sessions that have been actively
// executing a single statement for longer than the threshold and asks the
// server to cancel them. The collector's own sessions are excluded by
// application_name (and by backend pid for the watchdog's scan itself);
// they are already bounded by the 15 s statement timeout set at connect.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use sqlx::{PgPool, Row};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::db::store::APP_NAME;
use crate::metrics::Metrics;

const RUNAWAY_QUERY: &str = "\
    SELECT pid, application_name, \
           EXTRACT(EPOCH FROM (now() - query_start))::BIGINT AS age_secs \
    FROM pg_stat_activity \
    WHERE datname = current_database() \
      AND state = 'active' \
      AND pid <> pg_backend_pid() \
      AND application_name <> $1 \
      AND now() - query_start > make_interval(secs => $2)";

pub struct Watchdog {
    pool: PgPool,
    metrics: Arc<Metrics>,
    interval: Duration,
    threshold: Duration,
}

impl Watchdog {
    pub fn new(
        pool: PgPool,
        metrics: Arc<Metrics>,
        interval_secs: u64,
        threshold_secs: u64,
    ) -> Self {
        Self {
            pool,
            metrics,
            interval: Duration::from_secs(interval_secs.max(1)),
            threshold: Duration::from_secs(threshold_secs.max(1)),
        }
    }

    /// Scan loop; returns when shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            threshold_secs = self.threshold.as_secs(),
            "DB watchdog started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a fresh start never
        // races schema bootstrap.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("DB watchdog stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "watchdog sweep failed");
                    }
                }
            }
        }
    }

    /// One sweep: find runaway sessions and cancel them.
    async fn sweep(&self) -> Result<(), sqlx::Error> {
        let runaways = sqlx::query(RUNAWAY_QUERY)
            .bind(APP_NAME)
            .bind(self.threshold.as_secs() as f64)
            .fetch_all(&self.pool)
            .await?;

        if runaways.is_empty() {
            debug!("watchdog sweep: no runaway sessions");
            return Ok(());
        }

        for row in runaways {
            let pid: i32 = row.get("pid");
            let app: String = row.get("application_name");
            let age_secs: i64 = row.get("age_secs");

            let cancelled: bool = sqlx::query_scalar("SELECT pg_cancel_backend($1)")
                .bind(pid)
                .fetch_one(&self.pool)
                .await?;

            if cancelled {
                self.metrics.watchdog_cancels.fetch_add(1, Ordering::Relaxed);
                warn!(pid, application_name = %app, age_secs, "cancelled runaway statement");
            } else {
                debug!(pid, "cancel request ignored, session already gone");
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
    fn runaway_query_filters_are_complete() {
        assert!(RUNAWAY_QUERY.contains("state = 'active'"));
        assert!(RUNAWAY_QUERY.contains("datname = current_database()"));
        assert!(RUNAWAY_QUERY.contains("pid <> pg_backend_pid()"));
        assert!(RUNAWAY_QUERY.contains("application_name <> $1"));
        assert!(RUNAWAY_QUERY.contains("make_interval(secs => $2)"));
    }

    #[tokio::test]
    async fn intervals_have_a_sane_floor() {
        // Zero-valued env settings must not produce a busy loop.
        let metrics = Arc::new(Metrics::new());
        let pool_opts = sqlx::postgres::PgPoolOptions::new();
        let pool = pool_opts.connect_lazy("postgres://localhost/none").unwrap();
        let wd = Watchdog::new(pool, metrics, 0, 0);
        assert_eq!(wd.interval, Duration::from_secs(1));
        assert_eq!(wd.threshold, Duration::from_secs(1));
    }
}
