//! Error types for the bridge

use thiserror::Error;

use crate::protocol::ErrorCode;

/// Bridge errors
///
/// Transport and decrypt failures are recovered where they happen. The
/// authorization and dispatch variants travel back to the remote caller as
/// protocol error responses.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Relay unreachable, socket closed or no relay available for publishing
    #[error("Transport error: {0}")]
    Transport(String),

    /// Plaintext could not be encrypted (length out of range, key setup)
    #[error("Encrypt error: {0}")]
    Encrypt(String),

    /// Payload could not be decrypted (wrong key, tampered or malformed)
    #[error("Decrypt error: {0}")]
    Decrypt(String),

    /// Decrypted payload is not a well-formed request
    #[error("Parse error: {0}")]
    Parse(String),

    /// Method name outside the supported command set
    #[error("Method not implemented: {0}")]
    NotImplemented(String),

    /// Sender has no (live) connection record
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Connection exists but may not call this method
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Request would push the period spend above the connection budget
    #[error("Budget exceeded: requested {requested} msat, remaining {remaining} msat")]
    BudgetExceeded { requested: u64, remaining: u64 },

    /// The wallet command itself failed
    #[error("Dispatch error: {code}: {message}")]
    Dispatch { code: ErrorCode, message: String },

    /// Invalid configuration or persisted record
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Key-value store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BridgeError {
    /// Protocol error code reported to the remote application
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            BridgeError::Parse(_) => ErrorCode::Other,
            BridgeError::NotImplemented(_) => ErrorCode::NotImplemented,
            BridgeError::Unauthorized(_) => ErrorCode::Unauthorized,
            BridgeError::PermissionDenied(_) => ErrorCode::Restricted,
            BridgeError::BudgetExceeded { .. } => ErrorCode::QuotaExceeded,
            BridgeError::Dispatch { code, .. } => *code,
            BridgeError::Transport(_)
            | BridgeError::Encrypt(_)
            | BridgeError::Decrypt(_)
            | BridgeError::Configuration(_)
            | BridgeError::Storage(_)
            | BridgeError::Serialization(_) => ErrorCode::Internal,
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Storage(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            BridgeError::Unauthorized("x".into()).to_error_code(),
            ErrorCode::Unauthorized
        );
        assert_eq!(
            BridgeError::PermissionDenied("x".into()).to_error_code(),
            ErrorCode::Restricted
        );
        assert_eq!(
            BridgeError::BudgetExceeded {
                requested: 2,
                remaining: 1
            }
            .to_error_code(),
            ErrorCode::QuotaExceeded
        );
        assert_eq!(
            BridgeError::Dispatch {
                code: ErrorCode::InsufficientBalance,
                message: "empty".into()
            }
            .to_error_code(),
            ErrorCode::InsufficientBalance
        );
        assert_eq!(BridgeError::Parse("x".into()).to_error_code(), ErrorCode::Other);
    }
}
