use rusqlite::ErrorCode;
use thiserror::Error;

/// Error taxonomy for the whole crate. Variants are kinds, not wrappers
/// around a single underlying type — a `rusqlite::Error` is classified into
/// the nearest kind at the `From` boundary rather than surfacing raw.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("schema error: {0}")]
    Schema(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("sync error: {0}")]
    Sync(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type DbResult<T> = Result<T, DbError>;

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ffi_err, ref msg) = err {
            if ffi_err.code == ErrorCode::ConstraintViolation {
                return DbError::Constraint(msg.clone().unwrap_or_else(|| err.to_string()));
            }
        }
        if matches!(err, rusqlite::Error::QueryReturnedNoRows) {
            return DbError::NotFound(err.to_string());
        }
        DbError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::InvalidValue(err.to_string())
    }
}
