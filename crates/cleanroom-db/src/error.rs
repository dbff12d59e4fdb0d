//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl From<DbError> for cleanroom_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => cleanroom_core::Error::NotFound(what),
            DbError::Duplicate(what) => cleanroom_core::Error::InvalidInput(format!(
                "duplicate {}",
                what
            )),
            other => cleanroom_core::Error::upstream("database", other),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
