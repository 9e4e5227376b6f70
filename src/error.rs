//! Error kinds shared by the whole crate.

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// An internal contract was violated (e.g. computing an objective its tag does not support)
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Bad user input: unknown nick, inconsistent folds, mismatched dimensions...
    #[error("Invalid value: {0}")]
    Value(String),

    /// A single fit failed (zero-variance column, singleton class...).
    /// Caught by the evaluator and recorded as NaN for the fold.
    #[error("Degenerate fit: {0}")]
    DegenerateFit(String),

    /// A disk write failed after its retry
    #[error("Persistence failure on {path}: {reason}")]
    Persistence { path: String, reason: String },

    /// The worker pool was shut down while a batch was pending
    #[error("Evaluation cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl Error {
    pub fn value<S: Into<String>>(msg: S) -> Error {
        Error::Value(msg.into())
    }

    pub fn illegal<S: Into<String>>(msg: S) -> Error {
        Error::IllegalState(msg.into())
    }

    pub fn degenerate<S: Into<String>>(msg: S) -> Error {
        Error::DegenerateFit(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        assert_eq!(Error::value("unknown nick foo").to_string(), "Invalid value: unknown nick foo");
        assert_eq!(Error::degenerate("singleton class").to_string(), "Degenerate fit: singleton class");
        let e = Error::Persistence { path: "a/b.json".to_string(), reason: "disk full".to_string() };
        assert!(e.to_string().contains("a/b.json"));
    }

    #[test]
    fn test_io_error_converts() {
        fn open() -> Result<std::fs::File> {
            Ok(std::fs::File::open("/definitely/not/here")?)
        }
        assert!(matches!(open(), Err(Error::Io(_))));
    }
}
