use thiserror::Error;

/// Convenient Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DbError>;

/// All possible errors surfaced by the index file engine.
///
/// The three variants map to the three classes of failure the engine
/// distinguishes: I/O errors are fatal to the operation that hit them,
/// [`DbError::TransactionAborted`] propagates uncaught out of every tree
/// operation and tells the caller to abort and retry, and
/// [`DbError::Invalid`] covers structural violations local to a single call
/// (bad record ids, schema mismatches, inserts into full pages).
#[derive(Debug, Error)]
pub enum DbError {
    /// I/O error from reading or writing the index file.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The transaction timed out waiting for a page lock and must abort.
    #[error("transaction aborted: timed out waiting for a page lock")]
    TransactionAborted,

    /// A structural invariant was violated by the caller or by page contents.
    #[error("{0}")]
    Invalid(String),
}

impl DbError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        DbError::Invalid(msg.into())
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DbError = io_err.into();
        assert!(matches!(err, DbError::Io(_)));
    }

    #[test]
    fn test_error_display() {
        let err = DbError::invalid("tuple has no record id");
        assert_eq!(format!("{err}"), "tuple has no record id");
        assert!(format!("{}", DbError::TransactionAborted).contains("aborted"));
    }
}
