//! Error types for table construction, reliability validation and framing.
//!
//! Construction errors surface at hub startup and abort it. Codec errors
//! surface per frame; the session decides whether they are fatal.

/// Failure building an immutable [`MethodTable`](crate::MethodTable).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MethodTableError {
    /// Two entries hash to the same method id.
    #[error("duplicate method id {method_id}")]
    DuplicateMethodId {
        /// The colliding id.
        method_id: i32,
    },

    /// Two named methods hash to the same method id.
    #[error("method '{second}' has the same id {method_id} as '{first}'")]
    DuplicateMethodName {
        /// The colliding id.
        method_id: i32,
        /// Name registered first.
        first: String,
        /// Name registered second.
        second: String,
    },

    /// An entry uses a method id the protocol reserves for itself.
    #[error("method id {method_id} is reserved by the protocol")]
    ReservedMethodId {
        /// The offending id.
        method_id: i32,
    },
}

/// Failure building a receiver reliability map.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReliabilityError {
    /// A method whose result is awaited was given a non-reliable class.
    #[error("receiver method '{method}' returns a value and must be reliable, got {reliability}")]
    AwaitableMustBeReliable {
        /// Method name.
        method: String,
        /// The rejected class.
        reliability: crate::Reliability,
    },

    /// Receiver ids collided.
    #[error(transparent)]
    Table(#[from] MethodTableError),
}

/// Failure encoding or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame is shorter than the fixed header, or a heartbeat payload is
    /// shorter than its fixed prefix.
    #[error("frame truncated: need {needed} bytes, got {actual}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        actual: usize,
    },

    /// The header combination has no meaning in this direction.
    #[error("unexpected frame: method id {method_id}, message id {message_id}")]
    UnexpectedFrame {
        /// Header method id.
        method_id: i32,
        /// Header message id.
        message_id: i16,
    },

    /// The serializer failed to encode a value.
    #[error("serialize: {0}")]
    Serialize(String),

    /// The serializer failed to decode a payload.
    #[error("deserialize: {0}")]
    Deserialize(String),
}
