//! Error types shared by the engine crates

use thiserror::Error;

/// Errors raised by platform plumbing (file access, configuration decoding)
#[derive(Debug, Error)]
pub enum PlatformError {
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration is structurally valid but semantically wrong
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration text could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PlatformError::Config("missing peer prefix".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing peer prefix");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PlatformError = io_err.into();
        assert!(matches!(err, PlatformError::Io(_)));
    }

    #[test]
    fn test_decode_error_conversion() {
        let json_err = serde_json::from_str::<u32>("not a number").unwrap_err();
        let err: PlatformError = json_err.into();
        assert!(err.to_string().starts_with("Decode error"));
    }
}
