//! Runtime migration runner.

use std::path::Path;

use sqlx::migrate::{MigrateError, Migrator};
use sqlx::PgPool;
use tracing::info;

/// Applies pending migrations from the configured directory.
pub async fn run(pool: &PgPool, dir: &Path) -> Result<(), MigrateError> {
    let migrator = Migrator::new(dir).await?;
    migrator.run(pool).await?;
    info!(dir = %dir.display(), "migrations applied");
    Ok(())
}
