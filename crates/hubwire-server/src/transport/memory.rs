//! Channel-backed in-memory transport.
//!
//! [`duplex`] returns the server half as a [`Transport`] and the client half
//! as a [`MemoryClient`]. Dropping or closing the client ends the server's
//! inbound stream.

use async_trait::async_trait;
use bytes::Bytes;
use hubwire_core::{CodecError, ServerFrame};
use tokio::sync::mpsc;

use super::{FrameSink, FrameSource, Transport, TransportError};

struct ChannelSource(mpsc::Receiver<Bytes>);

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next_frame(&mut self) -> Option<Result<Bytes, TransportError>> {
        self.0.recv().await.map(Ok)
    }
}

struct ChannelSink(Option<mpsc::Sender<Bytes>>);

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let tx = self.0.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.0 = None;
        Ok(())
    }
}

/// Client half of an in-memory transport.
#[derive(Debug)]
pub struct MemoryClient {
    tx: Option<mpsc::Sender<Bytes>>,
    rx: mpsc::Receiver<Bytes>,
    secondary_rx: Option<mpsc::Receiver<Bytes>>,
}

impl MemoryClient {
    /// Send a raw frame to the server.
    pub async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    /// Next raw frame from the primary stream; `None` once the server closed it.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Next parsed frame from the primary stream.
    pub async fn recv_frame(&mut self) -> Option<Result<ServerFrame, CodecError>> {
        self.recv().await.map(ServerFrame::parse)
    }

    /// A frame already queued on the primary stream, if any.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    /// Next raw frame from the secondary channel.
    pub async fn recv_secondary(&mut self) -> Option<Bytes> {
        match self.secondary_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// A frame already queued on the secondary channel, if any.
    pub fn try_recv_secondary(&mut self) -> Option<Bytes> {
        self.secondary_rx.as_mut().and_then(|rx| rx.try_recv().ok())
    }

    /// Close the client's outbound stream. The server sees end of stream.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

/// In-memory transport pair with `capacity` frames of buffering per direction.
pub fn duplex(capacity: usize) -> (Transport, MemoryClient) {
    let (to_server, server_rx) = mpsc::channel(capacity);
    let (to_client, client_rx) = mpsc::channel(capacity);
    let transport = Transport::new(ChannelSource(server_rx), ChannelSink(Some(to_client)));
    let client = MemoryClient {
        tx: Some(to_server),
        rx: client_rx,
        secondary_rx: None,
    };
    (transport, client)
}

/// Like [`duplex`], with a secondary server-to-client channel attached.
pub fn duplex_with_secondary(capacity: usize) -> (Transport, MemoryClient) {
    let (transport, mut client) = duplex(capacity);
    let (secondary_tx, secondary_rx) = mpsc::channel(capacity);
    client.secondary_rx = Some(secondary_rx);
    (transport.with_secondary(ChannelSink(Some(secondary_tx))), client)
}
