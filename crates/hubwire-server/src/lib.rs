//! # hubwire-server
//!
//! The per-connection engine of the hubwire streaming hub.
//!
//! - **Dispatch**: requests resolved through the method table and run one at a
//!   time per connection; failures become error frames ([`hub::dispatch`])
//! - **Client results**: server-to-client calls correlated by negative message
//!   ids ([`hub::pending`], [`rpc::client`])
//! - **Heartbeats**: one shared tick, per-connection ack timeouts and latency
//!   ([`hub::heartbeat`])
//! - **Groups**: named connection sets with encode-once fan-out and slow
//!   consumer protection ([`hub::groups`], [`hub::broadcast`])
//! - **Transports**: in-memory and length-delimited adapters ([`transport`])
//! - **Ambient**: `thiserror` errors, `tracing` logs, `metrics` counters, JSON
//!   options with env overrides, graceful shutdown

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod hub;
pub mod metrics;
pub mod rpc;
pub mod server;
pub mod settings;
pub mod shutdown;
pub mod transport;

pub use config::{GroupStoreKind, HeartbeatOptions, HubOptions};
pub use errors::{HubError, SettingsError};
pub use hub::DisconnectReason;
pub use hub::broadcast::GroupBroadcaster;
pub use hub::connection::HubConnection;
pub use hub::heartbeat::{HeartbeatHandle, HeartbeatManager, HeartbeatMetadataProvider};
pub use rpc::client::ClientProxy;
pub use rpc::context::HubCallContext;
pub use rpc::registry::{HandlerOutput, MethodHandler, MethodRegistry, handler_fn, void_handler_fn};
pub use server::{Hub, HubBuilder, HubLifecycle, NoopLifecycle};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
pub use transport::{FrameSink, FrameSource, Transport, TransportError};
