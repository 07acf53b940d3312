//! Frame layout and the frame codec.
//!
//! Every frame starts with a fixed six byte header, `[methodId: i32 BE]
//! [messageId: i16 BE]`, followed by a payload produced by the pluggable
//! serializer. Routing decisions only ever look at the header, so a frame can
//! be dispatched (or dropped) without touching its payload.
//!
//! Heartbeat payloads are fixed-width and serializer-independent:
//!
//! ```text
//! server heartbeat   [seq: i16][serverSentAtUnixMs: i64][metadata...]
//! heartbeat ack      [seq: i16]
//! client heartbeat   [seq: i16][clientSentAt: i64][extra...]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::{
    CLIENT_HEARTBEAT_METHOD_ID, ERROR_METHOD_ID, FRAME_HEADER_LEN, HEARTBEAT_MESSAGE_ID,
    NO_RESPONSE_MESSAGE_ID, SERVER_HEARTBEAT_METHOD_ID, is_client_result_message_id,
};
use crate::errors::CodecError;
use crate::serializer::MessageSerializer;
use crate::status::StatusCode;

const HEARTBEAT_ACK_LEN: usize = 2;
const HEARTBEAT_PREFIX_LEN: usize = 10;

/// The fixed frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    /// Method id (or a reserved protocol id).
    pub method_id: i32,
    /// Correlation id.
    pub message_id: i16,
}

impl FrameHeader {
    /// Read the header from the start of a frame.
    pub fn read(frame: &[u8]) -> Result<Self, CodecError> {
        if frame.len() < FRAME_HEADER_LEN {
            return Err(CodecError::Truncated {
                needed: FRAME_HEADER_LEN,
                actual: frame.len(),
            });
        }
        let mut cursor = &frame[..FRAME_HEADER_LEN];
        Ok(Self {
            method_id: cursor.get_i32(),
            message_id: cursor.get_i16(),
        })
    }

    /// Append the header to `buf`.
    pub fn write(self, buf: &mut BytesMut) {
        buf.put_i32(self.method_id);
        buf.put_i16(self.message_id);
    }
}

/// Body of an error frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Status code.
    pub code: StatusCode,
    /// Short caller-facing description.
    pub detail: String,
    /// Underlying error text; present only when the server is configured to
    /// expose it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A frame received by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientFrame {
    /// Request expecting a response correlated by `message_id`.
    Request {
        /// Handler method id.
        method_id: i32,
        /// Correlation id (non-negative).
        message_id: i16,
        /// Serialized request.
        payload: Bytes,
    },
    /// Request that must never be answered.
    FireAndForget {
        /// Handler method id.
        method_id: i32,
        /// Serialized request.
        payload: Bytes,
    },
    /// Successful reply to a server-initiated client-result call.
    ClientResultReply {
        /// Receiver method id.
        method_id: i32,
        /// Client-result id (`<= -2`).
        message_id: i16,
        /// Serialized result.
        payload: Bytes,
    },
    /// Failed reply to a server-initiated client-result call.
    ClientResultError {
        /// Client-result id (`<= -2`).
        message_id: i16,
        /// Serialized [`ErrorPayload`].
        payload: Bytes,
    },
    /// Ack of a server heartbeat.
    HeartbeatAck {
        /// Sequence being acknowledged.
        sequence: i16,
    },
    /// Client-initiated heartbeat to be echoed back.
    ClientHeartbeat {
        /// Client sequence.
        sequence: i16,
        /// Client timestamp, opaque to the server.
        client_sent_at: i64,
        /// Extra bytes, echoed unchanged.
        extra: Bytes,
    },
}

impl ClientFrame {
    /// Classify a client-to-server frame by its header.
    pub fn parse(frame: Bytes) -> Result<Self, CodecError> {
        let header = FrameHeader::read(&frame)?;
        let payload = frame.slice(FRAME_HEADER_LEN..);

        match header.method_id {
            SERVER_HEARTBEAT_METHOD_ID => {
                let sequence = read_sequence(&payload, HEARTBEAT_ACK_LEN)?;
                Ok(Self::HeartbeatAck { sequence })
            }
            CLIENT_HEARTBEAT_METHOD_ID => {
                let (sequence, client_sent_at, extra) = read_heartbeat(payload)?;
                Ok(Self::ClientHeartbeat {
                    sequence,
                    client_sent_at,
                    extra,
                })
            }
            ERROR_METHOD_ID if is_client_result_message_id(header.message_id) => Ok(Self::ClientResultError {
                message_id: header.message_id,
                payload,
            }),
            ERROR_METHOD_ID => Err(CodecError::UnexpectedFrame {
                method_id: header.method_id,
                message_id: header.message_id,
            }),
            method_id => Ok(match header.message_id {
                NO_RESPONSE_MESSAGE_ID => Self::FireAndForget { method_id, payload },
                message_id if message_id >= 0 => Self::Request {
                    method_id,
                    message_id,
                    payload,
                },
                message_id => Self::ClientResultReply {
                    method_id,
                    message_id,
                    payload,
                },
            }),
        }
    }
}

/// A frame received by a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerFrame {
    /// Response to a request; an empty payload means the method returns nothing.
    Response {
        /// Handler method id.
        method_id: i32,
        /// Correlation id of the request.
        message_id: i16,
        /// Serialized response.
        payload: Bytes,
    },
    /// Error response to a request.
    Error {
        /// Correlation id of the request.
        message_id: i16,
        /// Serialized [`ErrorPayload`].
        payload: Bytes,
    },
    /// Broadcast or targeted push to a receiver method.
    Broadcast {
        /// Receiver method id.
        method_id: i32,
        /// Serialized arguments.
        payload: Bytes,
    },
    /// Server-initiated call awaiting a client result.
    ClientResultRequest {
        /// Receiver method id.
        method_id: i32,
        /// Client-result id (`<= -2`).
        message_id: i16,
        /// Serialized arguments.
        payload: Bytes,
    },
    /// Server heartbeat to be acked.
    Heartbeat {
        /// Server sequence.
        sequence: i16,
        /// Server wall clock in Unix milliseconds.
        server_sent_at: i64,
        /// Provider-defined metadata.
        metadata: Bytes,
    },
    /// Echo of a client heartbeat.
    ClientHeartbeatEcho {
        /// Client sequence.
        sequence: i16,
        /// Client timestamp as sent.
        client_sent_at: i64,
        /// Extra bytes as sent.
        extra: Bytes,
    },
}

impl ServerFrame {
    /// Classify a server-to-client frame by its header.
    pub fn parse(frame: Bytes) -> Result<Self, CodecError> {
        let header = FrameHeader::read(&frame)?;
        let payload = frame.slice(FRAME_HEADER_LEN..);

        match header.method_id {
            SERVER_HEARTBEAT_METHOD_ID => {
                let (sequence, server_sent_at, metadata) = read_heartbeat(payload)?;
                Ok(Self::Heartbeat {
                    sequence,
                    server_sent_at,
                    metadata,
                })
            }
            CLIENT_HEARTBEAT_METHOD_ID => {
                let (sequence, client_sent_at, extra) = read_heartbeat(payload)?;
                Ok(Self::ClientHeartbeatEcho {
                    sequence,
                    client_sent_at,
                    extra,
                })
            }
            ERROR_METHOD_ID => Ok(Self::Error {
                message_id: header.message_id,
                payload,
            }),
            method_id => Ok(match header.message_id {
                NO_RESPONSE_MESSAGE_ID => Self::Broadcast { method_id, payload },
                message_id if message_id >= 0 => Self::Response {
                    method_id,
                    message_id,
                    payload,
                },
                message_id => Self::ClientResultRequest {
                    method_id,
                    message_id,
                    payload,
                },
            }),
        }
    }
}

/// A serialized payload with header space reserved in front of it.
///
/// Lets a value be encoded before its header is known and then framed
/// without copying the payload.
#[derive(Debug)]
pub struct EncodedBody(BytesMut);

impl EncodedBody {
    /// A body with no payload.
    pub fn empty() -> Self {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN);
        buf.put_bytes(0, FRAME_HEADER_LEN);
        Self(buf)
    }

    /// Payload length, excluding the reserved header.
    pub fn payload_len(&self) -> usize {
        self.0.len() - FRAME_HEADER_LEN
    }

    /// Fill in the header and produce the wire frame.
    pub fn into_frame(mut self, method_id: i32, message_id: i16) -> Bytes {
        let mut header = &mut self.0[..FRAME_HEADER_LEN];
        header.put_i32(method_id);
        header.put_i16(message_id);
        self.0.freeze()
    }
}

/// Builds and decodes frames using a [`MessageSerializer`] for payloads.
#[derive(Clone, Debug, Default)]
pub struct FrameCodec<S> {
    serializer: S,
}

impl<S: MessageSerializer> FrameCodec<S> {
    /// Wrap a serializer.
    pub fn new(serializer: S) -> Self {
        Self { serializer }
    }

    /// The payload serializer.
    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    /// Serialize a value behind a reserved header.
    pub fn encode_body<T: Serialize + ?Sized>(&self, value: &T) -> Result<EncodedBody, CodecError> {
        let mut body = EncodedBody::empty();
        self.serializer.serialize(&mut body.0, value)?;
        Ok(body)
    }

    /// Client to server: request expecting a response.
    pub fn write_request<T: Serialize + ?Sized>(
        &self,
        method_id: i32,
        message_id: i16,
        value: &T,
    ) -> Result<Bytes, CodecError> {
        Ok(self.encode_body(value)?.into_frame(method_id, message_id))
    }

    /// Client to server: request that is never answered.
    pub fn write_fire_and_forget<T: Serialize + ?Sized>(&self, method_id: i32, value: &T) -> Result<Bytes, CodecError> {
        self.write_request(method_id, NO_RESPONSE_MESSAGE_ID, value)
    }

    /// Server to client: response carrying a value.
    pub fn write_response<T: Serialize + ?Sized>(
        &self,
        method_id: i32,
        message_id: i16,
        value: &T,
    ) -> Result<Bytes, CodecError> {
        Ok(self.encode_body(value)?.into_frame(method_id, message_id))
    }

    /// Server to client: response of a method that returns nothing.
    pub fn write_response_void(&self, method_id: i32, message_id: i16) -> Bytes {
        EncodedBody::empty().into_frame(method_id, message_id)
    }

    /// Server to client: error response correlated by `message_id`.
    pub fn write_error(
        &self,
        message_id: i16,
        code: StatusCode,
        detail: &str,
        message: Option<&str>,
    ) -> Result<Bytes, CodecError> {
        let payload = ErrorPayload {
            code,
            detail: detail.to_owned(),
            message: message.map(str::to_owned),
        };
        Ok(self.encode_body(&payload)?.into_frame(ERROR_METHOD_ID, message_id))
    }

    /// Server to client: broadcast or targeted push to a receiver method.
    pub fn write_broadcast<T: Serialize + ?Sized>(&self, method_id: i32, value: &T) -> Result<Bytes, CodecError> {
        Ok(self.encode_body(value)?.into_frame(method_id, NO_RESPONSE_MESSAGE_ID))
    }

    /// Server to client: client-result call.
    pub fn write_client_result_request<T: Serialize + ?Sized>(
        &self,
        method_id: i32,
        message_id: i16,
        value: &T,
    ) -> Result<Bytes, CodecError> {
        debug_assert!(is_client_result_message_id(message_id));
        Ok(self.encode_body(value)?.into_frame(method_id, message_id))
    }

    /// Client to server: successful client-result reply.
    pub fn write_client_result_reply<T: Serialize + ?Sized>(
        &self,
        method_id: i32,
        message_id: i16,
        value: &T,
    ) -> Result<Bytes, CodecError> {
        Ok(self.encode_body(value)?.into_frame(method_id, message_id))
    }

    /// Client to server: failed client-result reply.
    pub fn write_client_result_error(
        &self,
        message_id: i16,
        code: StatusCode,
        detail: &str,
        message: Option<&str>,
    ) -> Result<Bytes, CodecError> {
        self.write_error(message_id, code, detail, message)
    }

    /// Decode a payload.
    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError> {
        self.serializer.deserialize(payload)
    }

    /// Decode the payload of an error frame.
    pub fn decode_error(&self, payload: &[u8]) -> Result<ErrorPayload, CodecError> {
        self.serializer.deserialize(payload)
    }
}

/// Server to client heartbeat.
pub fn write_server_heartbeat(sequence: i16, server_sent_at_ms: i64, metadata: &[u8]) -> Bytes {
    write_heartbeat(SERVER_HEARTBEAT_METHOD_ID, sequence, server_sent_at_ms, metadata)
}

/// Client to server ack of a server heartbeat.
pub fn write_heartbeat_ack(sequence: i16) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + HEARTBEAT_ACK_LEN);
    FrameHeader {
        method_id: SERVER_HEARTBEAT_METHOD_ID,
        message_id: HEARTBEAT_MESSAGE_ID,
    }
    .write(&mut buf);
    buf.put_i16(sequence);
    buf.freeze()
}

/// Client-initiated heartbeat. The server echo has the identical layout.
pub fn write_client_heartbeat(sequence: i16, client_sent_at: i64, extra: &[u8]) -> Bytes {
    write_heartbeat(CLIENT_HEARTBEAT_METHOD_ID, sequence, client_sent_at, extra)
}

fn write_heartbeat(method_id: i32, sequence: i16, sent_at: i64, trailer: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + HEARTBEAT_PREFIX_LEN + trailer.len());
    FrameHeader {
        method_id,
        message_id: HEARTBEAT_MESSAGE_ID,
    }
    .write(&mut buf);
    buf.put_i16(sequence);
    buf.put_i64(sent_at);
    buf.extend_from_slice(trailer);
    buf.freeze()
}

fn read_sequence(payload: &[u8], needed: usize) -> Result<i16, CodecError> {
    if payload.len() < needed {
        return Err(CodecError::Truncated {
            needed: FRAME_HEADER_LEN + needed,
            actual: FRAME_HEADER_LEN + payload.len(),
        });
    }
    let mut cursor = payload;
    Ok(cursor.get_i16())
}

fn read_heartbeat(payload: Bytes) -> Result<(i16, i64, Bytes), CodecError> {
    let sequence = read_sequence(&payload, HEARTBEAT_PREFIX_LEN)?;
    let mut cursor = &payload[2..HEARTBEAT_PREFIX_LEN];
    let sent_at = cursor.get_i64();
    Ok((sequence, sent_at, payload.slice(HEARTBEAT_PREFIX_LEN..)))
}
