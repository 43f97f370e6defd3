//! Error types for the IKEv2 engine
//!
//! Parse and policy failures are ordinary values the SA state machine acts
//! on. Internal invariant violations (registry index mismatch, duplicate
//! SPIs, misaligned cipher input) are not represented here: they panic.

use ike_platform::PlatformError;
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// IKEv2 engine errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Invalid IKEv2 message format
    #[error("Invalid IKE message: {0}")]
    InvalidMessage(String),

    /// Invalid IKEv2 payload
    #[error("Invalid IKE payload: {0}")]
    InvalidPayload(String),

    /// Unsupported protocol version
    #[error("Unsupported IKE version: 0x{0:02x}")]
    UnsupportedVersion(u8),

    /// Unsupported exchange type
    #[error("Unsupported exchange type: {0}")]
    UnsupportedExchangeType(u8),

    /// Message too large
    #[error("IKE message too large: {0} bytes")]
    MessageTooLarge(u32),

    /// Length field below the payload's floor
    #[error("Invalid length: minimum {minimum}, got {actual}")]
    InvalidLength {
        /// Protocol-defined minimum
        minimum: usize,
        /// Value found on the wire
        actual: usize,
    },

    /// Buffer too short for operation
    #[error("Buffer too short: need {required} bytes, have {available}")]
    BufferTooShort {
        /// Required length
        required: usize,
        /// Available length
        available: usize,
    },

    /// No acceptable proposal found
    #[error("No acceptable proposal found in negotiation")]
    NoProposalChosen,

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// No peer policy covers the address/role
    #[error("No peer configuration for {0}")]
    NoPeerConfiguration(String),

    /// Peer identity rejected by policy
    #[error("Identity not allowed: {0}")]
    IdentityNotAllowed(String),

    /// Role ANY used as a lookup key
    #[error("Role ANY is not a valid policy lookup key")]
    InvalidRole,

    /// Security Association not found
    #[error("Security Association not found: {0}")]
    SaNotFound(String),

    /// State machine error
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Responder demands a cookie before committing state
    #[error("Cookie required")]
    CookieRequired,

    /// Peer stopped answering
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    /// Key of wrong length handed to a cipher suite
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Negotiated algorithm has no implementation
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Invalid argument
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Internal error (should not happen)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for failures caused by malformed wire data
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidMessage(_)
                | Error::InvalidPayload(_)
                | Error::UnsupportedVersion(_)
                | Error::UnsupportedExchangeType(_)
                | Error::MessageTooLarge(_)
                | Error::InvalidLength { .. }
                | Error::BufferTooShort { .. }
        )
    }

    /// True for failures caused by policy decisions
    pub fn is_policy_error(&self) -> bool {
        matches!(
            self,
            Error::NoProposalChosen
                | Error::AuthenticationFailed(_)
                | Error::NoPeerConfiguration(_)
                | Error::IdentityNotAllowed(_)
                | Error::InvalidRole
        )
    }
}

// Convert from std::io::Error
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<PlatformError> for Error {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::Io(e) => Error::Io(e.to_string()),
            other => Error::Config(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidMessage("test".to_string());
        assert_eq!(err.to_string(), "Invalid IKE message: test");

        let err = Error::UnsupportedVersion(0x10);
        assert_eq!(err.to_string(), "Unsupported IKE version: 0x10");

        let err = Error::InvalidLength {
            minimum: 9,
            actual: 8,
        };
        assert_eq!(err.to_string(), "Invalid length: minimum 9, got 8");
    }

    #[test]
    fn test_error_categories() {
        assert!(Error::BufferTooShort {
            required: 4,
            available: 1
        }
        .is_parse_error());
        assert!(!Error::InvalidRole.is_parse_error());
        assert!(Error::InvalidRole.is_policy_error());
        assert!(Error::IdentityNotAllowed("x".into()).is_policy_error());
        assert!(!Error::SaNotFound("x".into()).is_policy_error());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        match err {
            Error::Io(msg) => assert!(msg.contains("file not found")),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_platform_error_conversion() {
        let err: Error = PlatformError::Config("bad prefix".into()).into();
        assert_eq!(err, Error::Config("Configuration error: bad prefix".into()));
    }
}
