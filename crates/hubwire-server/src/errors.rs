//! Hub and settings error types.

use std::time::Duration;

use hubwire_core::{CodecError, MethodTableError, ReliabilityError, StatusCode};

use crate::transport::TransportError;

/// Errors raised by handlers, the dispatch engine and hub construction.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Return this status to the caller verbatim. Not logged as a server fault.
    #[error("{code}: {detail}")]
    Status {
        /// Status code for the error frame.
        code: StatusCode,
        /// Caller-facing detail.
        detail: String,
    },

    /// No handler is registered for the method id.
    #[error("method {method_id} is not implemented")]
    MethodNotFound {
        /// Requested method id.
        method_id: i32,
    },

    /// Encoding or decoding a payload failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The connection was already closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The connection was torn down while a client result was outstanding.
    #[error("client result cancelled: connection torn down")]
    PendingResultCancelled,

    /// The client did not reply to a client-result call in time.
    #[error("client result timed out after {0:?}")]
    ClientResultTimeout(Duration),

    /// The client replied to a client-result call with an error.
    #[error("client returned {code}: {detail}")]
    ClientResult {
        /// Status reported by the client.
        code: StatusCode,
        /// Detail reported by the client.
        detail: String,
        /// Optional underlying message from the client.
        message: Option<String>,
    },

    /// Every client-result id is in use on this connection.
    #[error("too many outstanding client results")]
    TooManyPendingResults,

    /// Two registered methods share a method id, or an id is reserved.
    #[error("invalid method registration: {0}")]
    Registration(#[from] MethodTableError),

    /// Receiver method declarations are invalid.
    #[error("invalid receiver declaration: {0}")]
    Receiver(#[from] ReliabilityError),

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Internal failure with a message.
    #[error("{0}")]
    Internal(String),

    /// Any other application error.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl HubError {
    /// Error that is returned to the caller with the given status.
    pub fn status(code: StatusCode, detail: impl Into<String>) -> Self {
        Self::Status {
            code,
            detail: detail.into(),
        }
    }

    /// Internal error with a message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Wrap an arbitrary application error.
    pub fn other(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Other(Box::new(err))
    }

    /// Short machine-readable kind, used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::MethodNotFound { .. } => "method_not_found",
            Self::Codec(_) => "codec",
            Self::ConnectionClosed => "connection_closed",
            Self::PendingResultCancelled => "pending_result_cancelled",
            Self::ClientResultTimeout(_) => "client_result_timeout",
            Self::ClientResult { .. } => "client_result",
            Self::TooManyPendingResults => "too_many_pending_results",
            Self::Registration(_) => "registration",
            Self::Receiver(_) => "receiver",
            Self::Transport(_) => "transport",
            Self::Internal(_) => "internal",
            Self::Other(_) => "other",
        }
    }
}

/// Errors that can occur when loading hub options.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// Failed to read the options file from disk.
    #[error("failed to read options file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the options file.
    #[error("failed to parse options JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// An option value was invalid.
    #[error("invalid option value: {0}")]
    InvalidValue(String),
}
