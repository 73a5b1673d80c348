//! Error types for Pequi
//!
//! `PequiError` is the application-level error enum shared across crates.
//! Narrow, module-specific failures (object access, invocation results) are
//! defined next to the code that produces them.

use serde::{Deserialize, Serialize};

/// Application-specific error types
#[derive(thiserror::Error, Debug)]
pub enum PequiError {
    #[error("caused: {0}")]
    IllegalArgument(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("authentication error: {0}")]
    AuthError(String),

    #[error("node store error: {0}")]
    StoreError(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PequiError {
    /// Shorthand for wrapping any displayable cause as a transport error
    pub fn transport(cause: impl std::fmt::Display) -> Self {
        PequiError::TransportError(cause.to_string())
    }
}

/// Error code structure carried in wire-level failure payloads
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ErrorCode<'a> {
    pub code: i32,
    pub message: &'a str,
}

pub const SUCCESS: ErrorCode<'static> = ErrorCode {
    code: 0,
    message: "success",
};

pub const ACCESS_DENIED: ErrorCode<'static> = ErrorCode {
    code: 10001,
    message: "access denied",
};

pub const OBJECT_NOT_FOUND: ErrorCode<'static> = ErrorCode {
    code: 10002,
    message: "object not found",
};

pub const AUTH_FAILED: ErrorCode<'static> = ErrorCode {
    code: 10003,
    message: "peer authentication failed",
};

pub const NODE_INFO_ERROR: ErrorCode<'static> = ErrorCode {
    code: 23001,
    message: "node info error",
};

pub const SERVER_ERROR: ErrorCode<'static> = ErrorCode {
    code: 30000,
    message: "server error",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PequiError::IllegalArgument("invalid node name".to_string());
        assert_eq!(format!("{}", err), "caused: invalid node name");

        let err = PequiError::AuthError("bad credential".to_string());
        assert_eq!(format!("{}", err), "authentication error: bad credential");

        let err = PequiError::transport("connection reset");
        assert_eq!(format!("{}", err), "transport error: connection reset");
    }

    #[test]
    fn test_error_code_constants() {
        assert_eq!(SUCCESS.code, 0);
        assert_eq!(SUCCESS.message, "success");
        assert_eq!(ACCESS_DENIED.code, 10001);
        assert_eq!(AUTH_FAILED.code, 10003);
    }
}
