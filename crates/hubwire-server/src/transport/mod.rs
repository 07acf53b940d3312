//! Duplex frame transport seam.
//!
//! The engine reads whole frames from a [`FrameSource`] and writes whole frames
//! to a [`FrameSink`]. Exactly one writer task owns each sink; every other
//! producer (responses, broadcasts, heartbeats) enqueues onto that task.
//!
//! Adapters:
//! - [`memory`]: channel-backed pair, with an optional secondary channel
//! - [`framed`]: any `AsyncRead + AsyncWrite` with 4-byte length prefixes

pub mod framed;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;

/// Transport failure.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The underlying stream failed.
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
    /// The peer side is gone.
    #[error("transport closed")]
    Closed,
}

/// Inbound half of a duplex stream.
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next complete frame; `None` at end of stream.
    async fn next_frame(&mut self) -> Option<Result<Bytes, TransportError>>;
}

/// Outbound half of a duplex stream.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Write one complete frame.
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Flush and close the stream.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// One accepted connection as seen by the engine.
pub struct Transport {
    /// Reliable ordered inbound stream.
    pub source: Box<dyn FrameSource>,
    /// Reliable ordered outbound stream.
    pub sink: Box<dyn FrameSink>,
    /// Optional lossy outbound channel for non-reliable receiver methods.
    pub secondary: Option<Box<dyn FrameSink>>,
}

impl Transport {
    /// A transport without a secondary channel.
    pub fn new(source: impl FrameSource, sink: impl FrameSink) -> Self {
        Self {
            source: Box::new(source),
            sink: Box::new(sink),
            secondary: None,
        }
    }

    /// Attach a secondary channel.
    #[must_use]
    pub fn with_secondary(mut self, secondary: impl FrameSink) -> Self {
        self.secondary = Some(Box::new(secondary));
        self
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("secondary", &self.secondary.is_some())
            .finish_non_exhaustive()
    }
}
