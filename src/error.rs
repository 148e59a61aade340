//! Error types for stagehand
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur in stagehand
#[derive(Debug, Error)]
pub enum StagehandError {
    /// Referenced row does not exist in the store
    #[error("not found: {0}")]
    NotFound(&'static str),

    /// User-surfaced validation failure (4xx-equivalent)
    #[error("validation failed: {0}")]
    Validation(String),

    /// Store/persistence error
    #[error("store error: {0}")]
    Store(String),

    /// Runner protocol error (registration, progress, poll)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Playbook or git subprocess terminated abnormally
    #[error("subprocess failed: {0}")]
    Subprocess(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl StagehandError {
    /// True for the sentinel that distinguishes absence from failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StagehandError::NotFound(_))
    }
}

/// Result type alias for stagehand operations
pub type Result<T> = std::result::Result<T, StagehandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = StagehandError::NotFound("template");
        assert_eq!(err.to_string(), "not found: template");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_validation_error() {
        let err = StagehandError::Validation("build template has no start version".to_string());
        assert_eq!(err.to_string(), "validation failed: build template has no start version");
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_subprocess_error() {
        let err = StagehandError::Subprocess("exit code 2".to_string());
        assert_eq!(err.to_string(), "subprocess failed: exit code 2");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: StagehandError = io_err.into();
        assert!(matches!(err, StagehandError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let err: StagehandError = json_err.into();
        assert!(matches!(err, StagehandError::Json(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        assert!(returns_ok().is_ok());
    }
}
