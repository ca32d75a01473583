use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("partition '{0}' is not open")]
    NotOpen(String),

    #[error("invalid audit month key: '{0}' (expected YYYY-MM)")]
    InvalidMonthKey(String),

    #[error("backup destination already exists: {0}")]
    BackupExists(PathBuf),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
