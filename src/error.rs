use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("File size {size} bytes exceeds the limit of {limit} bytes")]
    SizeLimitExceeded { size: u64, limit: u64 },
    #[error("Parse error: {0}")]
    ParseFailure(String),
    #[error("Worker for chunk {chunk} timed out after {timeout_ms}ms")]
    WorkerTimeout { chunk: usize, timeout_ms: u64 },
    #[error("Worker for chunk {chunk} crashed: {reason}")]
    WorkerCrash { chunk: usize, reason: String },
    #[error("Cache write failed: {0}")]
    CacheWriteFailure(String),
    #[error("Validation issue: {0}")]
    ValidationIssue(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Analysis aborted")]
    Aborted,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Tag reported as `errorType` on failed results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
pub enum ErrorType {
    UnsupportedFormat,
    SizeLimitExceeded,
    ParseFailure,
    WorkerTimeout,
    WorkerCrash,
    CacheWriteFailure,
    ValidationIssue,
    InvalidConfiguration,
    Aborted,
    IoError,
    SerializationError,
}

impl EngineError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            EngineError::UnsupportedFormat(_) => ErrorType::UnsupportedFormat,
            EngineError::SizeLimitExceeded { .. } => ErrorType::SizeLimitExceeded,
            EngineError::ParseFailure(_) => ErrorType::ParseFailure,
            EngineError::WorkerTimeout { .. } => ErrorType::WorkerTimeout,
            EngineError::WorkerCrash { .. } => ErrorType::WorkerCrash,
            EngineError::CacheWriteFailure(_) => ErrorType::CacheWriteFailure,
            EngineError::ValidationIssue(_) => ErrorType::ValidationIssue,
            EngineError::InvalidConfiguration(_) => ErrorType::InvalidConfiguration,
            EngineError::Aborted => ErrorType::Aborted,
            EngineError::Io(_) => ErrorType::IoError,
            EngineError::Serialization(_) => ErrorType::SerializationError,
        }
    }
}

impl From<calamine::Error> for EngineError {
    fn from(err: calamine::Error) -> Self {
        EngineError::ParseFailure(err.to_string())
    }
}

impl From<zip::result::ZipError> for EngineError {
    fn from(err: zip::result::ZipError) -> Self {
        EngineError::ParseFailure(format!("Invalid container: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_types_map_one_to_one() {
        let err = EngineError::SizeLimitExceeded { size: 10, limit: 5 };
        assert_eq!(err.error_type(), ErrorType::SizeLimitExceeded);
        assert!(err.to_string().contains("exceeds the limit of 5 bytes"));

        let io = EngineError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "missing"));
        assert_eq!(io.error_type(), ErrorType::IoError);
    }
}
