//! Connection pool and schema migrations.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::config::Config;

/// Create a database connection pool
pub async fn create_pool(config: &Config) -> Result<PgPool, sqlx::Error> {
    info!(
        url = %mask_password(&config.database_url),
        max_connections = config.database_max_connections,
        "Connecting to database"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Apply the embedded schema migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    info!("Running database migrations");
    sqlx::migrate!("../../migrations").run(pool).await?;
    info!("Database migrations completed");
    Ok(())
}

/// Hide the password component of a connection URL for logging
pub fn mask_password(url: &str) -> String {
    let Some(authority_start) = url.find("://").map(|pos| pos + 3) else {
        return url.to_string();
    };
    if let Some(at_pos) = url[authority_start..].rfind('@').map(|pos| pos + authority_start) {
        if let Some(colon_pos) = url[authority_start..at_pos]
            .find(':')
            .map(|pos| pos + authority_start)
        {
            let mut masked = url.to_string();
            masked.replace_range(colon_pos + 1..at_pos, "****");
            return masked;
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_password() {
        assert_eq!(
            mask_password("postgres://qms:hunter2@db:5432/qms"),
            "postgres://qms:****@db:5432/qms"
        );
    }

    #[test]
    fn test_mask_password_without_credentials() {
        assert_eq!(
            mask_password("postgres://db:5432/qms"),
            "postgres://db:5432/qms"
        );
        assert_eq!(
            mask_password("postgres://qms@db/qms"),
            "postgres://qms@db/qms"
        );
    }
}
