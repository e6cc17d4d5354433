use plotwalk_scanner::ScanError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Browser error: {0}")]
    Scan(#[from] ScanError),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl SweepError {
    /// Ends the run instead of being recovered from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SweepError::AuthFailed(_)
                | SweepError::Scan(ScanError::Auth(_))
                | SweepError::Database(_)
                | SweepError::Config(_)
                | SweepError::LockPoisoned
        )
    }
}

pub type Result<T> = std::result::Result<T, SweepError>;
