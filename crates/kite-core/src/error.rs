//! Error types for the Kite session engine.
//!
//! Every failure the engine can report to a caller or to a remote peer is a
//! variant of [`KiteError`]. Per-request failures are converted to JSON-RPC
//! error objects with [`KiteError::to_rpc_error_code`] and sent back to the
//! calling peer; only `Config` is fatal, and only at node construction.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the Kite library.
#[derive(Debug, Error)]
pub enum KiteError {
    // Startup errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Authentication errors
    #[error("Authentication rejected: {reason}")]
    AuthRejected { reason: String },

    #[error("Unknown authentication type: {auth_type}")]
    UnknownAuthType { auth_type: String },

    // Dispatch errors
    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Handler for {method} failed: {message}")]
    Handler { method: String, message: String },

    #[error("Method {method} is reserved and cannot be replaced while serving")]
    ReservedMethod { method: String },

    // Session errors
    #[error("No pending call for response id {id}")]
    UnmatchedResponse { id: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Call to {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// Error envelope returned by the remote peer.
    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },

    // Transport errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for Kite operations.
pub type Result<T> = std::result::Result<T, KiteError>;

impl From<std::io::Error> for KiteError {
    fn from(err: std::io::Error) -> Self {
        KiteError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for KiteError {
    fn from(err: serde_json::Error) -> Self {
        KiteError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl KiteError {
    /// Shorthand for an authentication rejection.
    pub fn rejected(reason: impl Into<String>) -> Self {
        KiteError::AuthRejected {
            reason: reason.into(),
        }
    }

    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        KiteError::Config {
            message: message.into(),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Handler failure
    /// - -32001: Authentication rejected
    /// - -32002: Unknown authentication type
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            KiteError::Handler { .. } => -32000,
            KiteError::AuthRejected { .. } => -32001,
            KiteError::UnknownAuthType { .. } => -32002,
            KiteError::MethodNotFound { .. } => -32601,
            KiteError::InvalidParams { .. } => -32602,
            KiteError::Protocol { .. } | KiteError::Json { .. } => -32700,
            KiteError::Remote { code, .. } => *code,

            // All other errors are internal errors
            _ => -32603,
        }
    }

    /// JSON-RPC code carried by a remote error envelope, if this is one.
    pub fn remote_code(&self) -> Option<i32> {
        match self {
            KiteError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}
