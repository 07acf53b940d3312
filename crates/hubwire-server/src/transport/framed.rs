//! Length-delimited transport over any byte stream.
//!
//! Each frame is prefixed with its length as a 4-byte big-endian integer,
//! via `tokio_util::codec::LengthDelimitedCodec`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::{FrameSink, FrameSource, Transport, TransportError};

/// Build a length-delimited codec accepting frames up to `max_frame_len`.
pub fn codec(max_frame_len: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_len)
        .new_codec()
}

/// Wrap a byte stream as a [`Transport`].
pub fn framed<T>(io: T, max_frame_len: usize) -> Transport
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, stream) = Framed::new(io, codec(max_frame_len)).split();
    Transport::new(FramedSource { inner: stream }, FramedSink { inner: sink })
}

struct FramedSource<T> {
    inner: SplitStream<Framed<T, LengthDelimitedCodec>>,
}

#[async_trait]
impl<T> FrameSource for FramedSource<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn next_frame(&mut self) -> Option<Result<Bytes, TransportError>> {
        self.inner
            .next()
            .await
            .map(|item| item.map(bytes::BytesMut::freeze).map_err(TransportError::from))
    }
}

struct FramedSink<T> {
    inner: SplitSink<Framed<T, LengthDelimitedCodec>, Bytes>,
}

#[async_trait]
impl<T> FrameSink for FramedSink<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.inner.send(frame).await.map_err(TransportError::from)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await.map_err(TransportError::from)
    }
}
