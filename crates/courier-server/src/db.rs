//! PostgreSQL pool construction and the database-backed capability bag.

use sqlx::postgres::{PgPool, PgPoolOptions};

use courier_core::Repository;

use crate::config::PostgresConfig;

/// Builds a connection pool and verifies it with a probe query.
pub async fn connect(config: &PostgresConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_conns)
        .min_connections(config.min_conns)
        .connect(&config.dsn())
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;

    Ok(pool)
}

/// Postgres-backed capability bag handed to handler constructors.
///
/// The bus treats it as opaque; handlers that know about it reach the pool
/// through [`PgRepository::pool`].
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    /// Wraps an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Repository for PgRepository {}

impl std::fmt::Debug for PgRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgRepository").finish_non_exhaustive()
    }
}
