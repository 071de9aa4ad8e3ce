// =============================================================================
// Store Connection — pool construction, TLS negotiation, session defaults
// =============================================================================
//
// Every pooled session is initialized with hard statement/lock/idle timeouts
// so that a single pathological statement cannot pin a connection, and with
// an application_name the watchdog uses to recognize the collector's own
// sessions.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{Executor, PgPool};
use tracing::info;

use crate::config::Config;

/// application_name registered by every collector session.
pub const APP_NAME: &str = "helios_ingest";

const POOL_MIN_CONNECTIONS: u32 = 2;
const POOL_MAX_CONNECTIONS: u32 = 10;

/// Session defaults applied on every new pooled connection.
const SESSION_INIT: &str = "\
    SET statement_timeout = '15s'; \
    SET lock_timeout = '5s'; \
    SET idle_in_transaction_session_timeout = '10s';";

/// Map a `DB_SSLMODE` value onto sqlx's TLS modes. `verify-none` is accepted
/// as a legacy alias for `require`.
pub fn parse_ssl_mode(mode: &str) -> Result<PgSslMode> {
    match mode.trim().to_lowercase().as_str() {
        "disable" => Ok(PgSslMode::Disable),
        "allow" => Ok(PgSslMode::Allow),
        "prefer" => Ok(PgSslMode::Prefer),
        "require" | "verify-none" => Ok(PgSslMode::Require),
        "verify-ca" => Ok(PgSslMode::VerifyCa),
        "verify-full" => Ok(PgSslMode::VerifyFull),
        other => anyhow::bail!("unrecognized DB_SSLMODE value: {other}"),
    }
}

/// Build the bounded connection pool from the configured DSN and TLS
/// options, and probe it once so a bad DSN fails at startup instead of at
/// the first flush.
pub async fn connect_pool(config: &Config) -> Result<PgPool> {
    let mut options: PgConnectOptions = config
        .database_url
        .parse()
        .context("failed to parse DATABASE_URL")?;

    if let Some(mode) = &config.db_sslmode {
        options = options.ssl_mode(parse_ssl_mode(mode)?);
    }
    if let Some(cert) = &config.db_sslrootcert {
        options = options.ssl_root_cert(cert.as_str());
    }
    options = options.application_name(APP_NAME);

    let pool = PgPoolOptions::new()
        .min_connections(POOL_MIN_CONNECTIONS)
        .max_connections(POOL_MAX_CONNECTIONS)
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute(SESSION_INIT).await?;
                Ok(())
            })
        })
        .connect_with(options)
        .await
        .context("failed to connect to the store")?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .context("store probe query failed")?;

    info!(
        min = POOL_MIN_CONNECTIONS,
        max = POOL_MAX_CONNECTIONS,
        "store connection pool ready"
    );
    Ok(pool)
}
