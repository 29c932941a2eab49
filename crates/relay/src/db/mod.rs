// PostgreSQL bootstrap for the operation log, participant, comment and
// snapshot tables. Connections must use TLS.

use anyhow::{bail, Context, Result};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use tracing::{info, info_span, Instrument};

use crate::config::PoolSettings;

pub static MIGRATOR: Migrator = sqlx::migrate!("./src/db/migrations");

/// Opens the pool, checks that the server answers and applies pending
/// migrations.
pub async fn connect(database_url: &str, settings: &PoolSettings) -> Result<PgPool> {
    let options = database_url
        .parse::<PgConnectOptions>()
        .context("failed to parse relay PostgreSQL connection options")?;
    require_tls(&options)?;

    let pool = PgPoolOptions::new()
        .min_connections(settings.min_connections)
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .connect_with(options)
        .await
        .context("failed to connect to relay PostgreSQL")?;

    ping(&pool).await?;
    MIGRATOR
        .run(&pool)
        .instrument(info_span!("relay.db.migrate"))
        .await
        .context("failed to apply relay PostgreSQL migrations")?;
    info!(
        min_connections = settings.min_connections,
        max_connections = settings.max_connections,
        "relay PostgreSQL ready"
    );
    Ok(pool)
}

pub async fn ping(pool: &PgPool) -> Result<()> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .instrument(info_span!("relay.db.query", query = "ping"))
        .await
        .context("relay PostgreSQL health check failed")?;
    Ok(())
}

fn require_tls(options: &PgConnectOptions) -> Result<()> {
    match options.get_ssl_mode() {
        PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull => Ok(()),
        mode => bail!("relay PostgreSQL connection must require TLS; got sslmode={mode:?}"),
    }
}
