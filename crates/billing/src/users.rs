//! Account holders, created lazily on first reference.

use qms_shared::UserId;
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;

use crate::error::{LedgerError, LedgerResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: UserId,
    pub username: String,
}

fn normalize(username: &str) -> LedgerResult<&str> {
    let username = username.trim();
    if username.is_empty() {
        return Err(LedgerError::InvalidInput("username is required".to_string()));
    }
    Ok(username)
}

/// Return the user with the given username, creating it if necessary.
pub async fn ensure_user(conn: &mut PgConnection, username: &str) -> LedgerResult<User> {
    let username = normalize(username)?;

    // DO UPDATE (not DO NOTHING) so RETURNING yields the existing row
    let user: User = sqlx::query_as(
        r#"
        INSERT INTO users (username)
        VALUES ($1)
        ON CONFLICT (username) DO UPDATE SET username = EXCLUDED.username
        RETURNING id, username
        "#,
    )
    .bind(username)
    .fetch_one(&mut *conn)
    .await?;

    Ok(user)
}

pub async fn find_user(conn: &mut PgConnection, username: &str) -> LedgerResult<Option<User>> {
    let username = normalize(username)?;
    let user = sqlx::query_as("SELECT id, username FROM users WHERE username = $1")
        .bind(username)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(user)
}

/// Every known user, ordered by username
pub async fn list_users(conn: &mut PgConnection) -> LedgerResult<Vec<User>> {
    let users = sqlx::query_as("SELECT id, username FROM users ORDER BY username")
        .fetch_all(&mut *conn)
        .await?;
    Ok(users)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_trims_and_rejects_blank() {
        assert_eq!(normalize("  alice ").unwrap(), "alice");
        assert!(matches!(normalize("   "), Err(LedgerError::InvalidInput(_))));
    }
}
