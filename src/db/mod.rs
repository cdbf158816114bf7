pub mod queries;

use anyhow::Context;

use crate::config::AppConfig;

// ─── Database-Agnostic Pool Types ─────────────────────
//
// Exactly one of `postgres` or `sqlite` feature must be enabled.
// The Pool type alias makes the rest of the codebase database-agnostic.

#[cfg(all(feature = "postgres", feature = "sqlite"))]
compile_error!("Features `postgres` and `sqlite` are mutually exclusive. Enable only one.");

#[cfg(not(any(feature = "postgres", feature = "sqlite")))]
compile_error!("Either `postgres` or `sqlite` feature must be enabled.");

#[cfg(feature = "postgres")]
pub type Db = sqlx::Postgres;

#[cfg(feature = "sqlite")]
pub type Db = sqlx::Sqlite;

pub type Pool = sqlx::Pool<Db>;

/// Connect to the configured database and run migrations.
#[cfg(feature = "postgres")]
pub async fn init_pool(config: &AppConfig) -> anyhow::Result<Pool> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    tracing::info!("PostgreSQL connected and migrations applied");
    Ok(pool)
}

/// Connect to the configured database and run migrations.
#[cfg(feature = "sqlite")]
pub async fn init_pool(config: &AppConfig) -> anyhow::Result<Pool> {
    use std::str::FromStr;

    // Ensure parent directory exists for SQLite file
    if let Some(path) = config.database_url.strip_prefix("sqlite:") {
        let path = path.trim_start_matches("//");
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
    }

    let options = sqlx::sqlite::SqliteConnectOptions::from_str(&config.database_url)
        .context("Invalid SQLite DATABASE_URL")?
        .create_if_missing(true)
        // WAL mode for better concurrent read/write performance
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect_with(options)
        .await
        .context("Failed to connect to SQLite")?;

    sqlx::migrate!("./migrations_sqlite")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    tracing::info!("SQLite connected and migrations applied");
    Ok(pool)
}
