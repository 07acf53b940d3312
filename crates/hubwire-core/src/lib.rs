//! # hubwire-core
//!
//! Transport-independent building blocks of the hubwire streaming hub.
//!
//! - **Method ids**: FNV-1a 32-bit hashes of method names ([`hashing`])
//! - **Method table**: immutable power-of-two bucket table resolving a method id
//!   to its handler without string hashing on the hot path ([`method_table`])
//! - **Frames**: the fixed-width `[methodId][messageId]` header plus a
//!   serializer-defined payload, in both directions ([`frame`])
//! - **Serializers**: the pluggable [`serializer::MessageSerializer`] seam with a
//!   JSON implementation
//! - **Reliability**: per-method delivery classes and the routing decision
//!   between the reliable stream and an optional side channel ([`reliability`])
//! - **Errors**: `thiserror` enums for every startup and codec failure
//! - **Logging**: `tracing` subscriber bootstrap

#![deny(unsafe_code)]

pub mod constants;
pub mod errors;
pub mod frame;
pub mod hashing;
pub mod ids;
pub mod logging;
pub mod method_table;
pub mod reliability;
pub mod serializer;
pub mod status;

pub use errors::{CodecError, MethodTableError, ReliabilityError};
pub use frame::{ClientFrame, EncodedBody, ErrorPayload, FrameCodec, FrameHeader, ServerFrame};
pub use hashing::{fnv1a32, method_id};
pub use ids::ConnectionId;
pub use method_table::MethodTable;
pub use reliability::{Reliability, ReliabilityRouter, ReceiverMethod, ReceiverMethodMap, Route};
pub use serializer::{JsonSerializer, MessageSerializer};
pub use status::StatusCode;
