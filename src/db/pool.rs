use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::RelayerConfig;
use crate::error::DomainError;

/// Connects to Postgres using the configured URL and pool size, then runs
/// embedded migrations (`./migrations`).
pub async fn build_pool(config: &RelayerConfig) -> Result<PgPool, DomainError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .map_err(|e| DomainError::Fatal(format!("failed to connect to Postgres: {e}")))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| DomainError::Fatal(format!("db migration failed: {e}")))?;

    Ok(pool)
}
