//! Hub method handlers and the per-call surface they see.
//!
//! - [`registry`]: handler trait, typed adapters and the registry that builds
//!   the method table
//! - [`context`]: the per-call context (groups, broadcasts, client calls)
//! - [`client`]: server-to-client invocations on one connection

pub mod client;
pub mod context;
pub mod registry;
