//! Connection-level engine components.
//!
//! - [`connection`]: per-connection outbound queues and close signalling
//! - [`pending`]: client-result correlation
//! - [`heartbeat`]: shared heartbeat tick and per-connection timeouts
//! - [`groups`]: group membership stores
//! - [`broadcast`]: encode-once group fan-out
//! - [`dispatch`]: single-request dispatch and error mapping
//! - [`session`]: the per-connection read loop and teardown

pub mod broadcast;
pub mod connection;
pub mod dispatch;
pub mod groups;
pub mod heartbeat;
pub mod pending;
pub mod session;

use std::fmt;

/// Why a connection ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client closed its stream.
    ClientClosed,
    /// No heartbeat ack arrived within the timeout.
    HeartbeatTimeout,
    /// The transport failed.
    TransportError(String),
    /// A frame could not be parsed; framing is no longer trustworthy.
    MalformedFrame(String),
    /// The client could not keep up with outbound traffic.
    SlowConsumer,
    /// The hub is shutting down.
    ServerShutdown,
    /// Server code closed the connection.
    ServerClosed,
    /// A connect hook refused the connection.
    Rejected(String),
}

impl DisconnectReason {
    /// Short label, used for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::TransportError(_) => "transport_error",
            Self::MalformedFrame(_) => "malformed_frame",
            Self::SlowConsumer => "slow_consumer",
            Self::ServerShutdown => "server_shutdown",
            Self::ServerClosed => "server_closed",
            Self::Rejected(_) => "rejected",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportError(detail) | Self::MalformedFrame(detail) | Self::Rejected(detail) => {
                write!(f, "{}: {detail}", self.as_str())
            }
            _ => f.write_str(self.as_str()),
        }
    }
}
