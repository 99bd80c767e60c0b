use crate::types::{RelayError, Result};
use sqlx::sqlite::SqlitePool;
use std::path::Path;

pub type DbPool = SqlitePool;

pub const SCHEMA_VERSION: &str = "1";

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(RelayError::internal(
                "Invalid database path: Path contains non-UTF8 characters",
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let pool = SqlitePool::connect(&url).await?;

    configure_db(&pool).await?;

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        return Err(RelayError::internal(format!("Migration failed: {}", e)).into());
    }

    verify_schema_version(&pool).await;

    Ok(pool)
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    let pragmas = [
        "PRAGMA journal_mode = WAL",
        "PRAGMA synchronous = NORMAL",
        "PRAGMA busy_timeout = 5000",
        "PRAGMA foreign_keys = ON",
    ];

    for pragma in pragmas {
        sqlx::query(pragma).execute(pool).await?;
    }
    Ok(())
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) if version == SCHEMA_VERSION => {
            tracing::info!("Database initialized. Schema version: {}", version);
        }
        Ok((version,)) => {
            tracing::warn!(
                "Schema version {} does not match expected {}",
                version,
                SCHEMA_VERSION
            );
        }
        Err(e) => {
            tracing::warn!("Could not verify schema version: {}", e);
        }
    }
}
