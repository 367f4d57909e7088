//! Database error types.

use thiserror::Error;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// A row expected to exist was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A unique constraint was violated (e.g. duplicate hostname).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for DbError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => DbError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
                DbError::Conflict(db_err.message().to_string())
            }
            _ => DbError::Query(e),
        }
    }
}

impl DbError {
    /// Check if this is a retryable error.
    pub fn is_retryable(&self) -> bool {
        match self {
            DbError::Connect(_) => true,
            DbError::Query(e) => is_retryable_sqlx_error(e),
            _ => false,
        }
    }
}

fn is_retryable_sqlx_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_) => true,
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::PoolClosed => false,
        sqlx::Error::Database(db_err) => {
            // Postgres error codes that are retryable
            if let Some(code) = db_err.code() {
                matches!(
                    code.as_ref(),
                    "40001" | // serialization_failure
                    "40P01" | // deadlock_detected
                    "57P01" | // admin_shutdown
                    "57P02" | // crash_shutdown
                    "57P03"   // cannot_connect_now
                )
            } else {
                false
            }
        }
        _ => false,
    }
}
