//! Pluggable payload serialization.
//!
//! The frame header is fixed; everything after it is produced by a
//! [`MessageSerializer`]. The hub is generic over the serializer so that the
//! hot path monomorphizes instead of going through a vtable.

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::CodecError;

/// Encodes values into and decodes values out of frame payloads.
pub trait MessageSerializer: Send + Sync + 'static {
    /// Append the encoding of `value` to `buf`.
    fn serialize<T: Serialize + ?Sized>(&self, buf: &mut BytesMut, value: &T) -> Result<(), CodecError>;

    /// Decode a value from a complete payload.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// UTF-8 JSON payloads via `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl MessageSerializer for JsonSerializer {
    fn serialize<T: Serialize + ?Sized>(&self, buf: &mut BytesMut, value: &T) -> Result<(), CodecError> {
        serde_json::to_writer(buf.writer(), value).map_err(|e| CodecError::Serialize(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Deserialize(e.to_string()))
    }
}
