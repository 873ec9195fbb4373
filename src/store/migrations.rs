//! Database migrations using diesel_migrations.
//!
//! Embeds migrations at compile time and runs them via blocking tasks
//! to work with async connections.

use diesel::Connection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::info;

use super::pool::{to_diesel_error, DieselError};

pub const SQLITE_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/sqlite");

/// Run pending migrations for a database URL.
///
/// Creates a sync connection and runs migrations in a blocking task.
pub async fn run_migrations(database_url: &str) -> Result<(), DieselError> {
    let url = database_url
        .strip_prefix("sqlite:")
        .unwrap_or(database_url)
        .to_string();

    tokio::task::spawn_blocking(move || {
        let mut conn = diesel::SqliteConnection::establish(&url).map_err(to_diesel_error)?;

        let migrations = conn
            .run_pending_migrations(SQLITE_MIGRATIONS)
            .map_err(DieselError::QueryBuilderError)?;

        for migration in &migrations {
            info!("Applied migration: {}", migration);
        }

        if migrations.is_empty() {
            info!("No pending migrations");
        }

        Ok(())
    })
    .await
    .map_err(|e| DieselError::QueryBuilderError(Box::new(e)))?
}
