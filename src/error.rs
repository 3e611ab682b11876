use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ExtratoError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("Could not detect the bank for this file; choose the bank and try again")]
    BankNotDetected,

    #[error("Row {line}: {reason}")]
    RowParse { line: usize, reason: String },

    #[error("Upload session not found")]
    SessionNotFound,

    #[error("Upload session expired; upload the file again")]
    SessionExpired,

    #[error("Upload is {actual}, expected {expected}")]
    InvalidState { expected: String, actual: String },

    #[error("Another reclassification touching these transactions is in progress; try again")]
    PropagationConflict,

    #[error("Could not save changes; nothing was written, try again")]
    Persistence,

    #[error("Unknown transaction: {0}")]
    UnknownTransaction(i64),

    #[error("Unknown upload batch: {0}")]
    UnknownBatch(i64),

    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    #[error("Unknown subgroup '{subgroup}' for group '{group}'")]
    UnknownSubgroup { group: String, subgroup: String },

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("{0}")]
    Other(String),
}

impl ExtratoError {
    /// Failure inside an atomic write. The driver text names tables and
    /// columns, so it goes to the log only.
    pub fn persistence(err: impl std::fmt::Display) -> Self {
        error!(error = %err, "atomic write rolled back");
        ExtratoError::Persistence
    }
}

pub type Result<T> = std::result::Result<T, ExtratoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_hides_driver_text() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let driver = conn.execute("INSERT INTO upload_batches (id) VALUES (1)", []).unwrap_err();
        assert!(driver.to_string().contains("upload_batches"));

        let err = ExtratoError::persistence(driver);
        assert!(matches!(err, ExtratoError::Persistence));
        assert!(!err.to_string().contains("upload_batches"));
    }
}
