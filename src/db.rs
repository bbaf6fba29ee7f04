/// Database layer for Nexus Deploy
///
/// Manages the PostgreSQL connection pool and migrations. Domain models live
/// with their services; this module only owns the pool lifecycle.
use crate::config::DatabaseConfig;
use crate::error::{NexusError, NexusResult};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Create a PostgreSQL connection pool
pub async fn create_pool(config: &DatabaseConfig) -> NexusResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.dsn())
        .await
        .map_err(|e| NexusError::Internal(format!("Failed to connect to database: {}", e)))?;

    Ok(pool)
}

/// Run embedded migrations
pub async fn run_migrations(pool: &PgPool) -> NexusResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| NexusError::Internal(format!("Failed to run migrations: {}", e)))?;
    Ok(())
}

/// Verify the connection is usable
pub async fn test_connection(pool: &PgPool) -> NexusResult<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
