//! Wire-level constants shared by the server engine and clients.

/// Length of the fixed frame header: `[methodId: i32][messageId: i16]`.
pub const FRAME_HEADER_LEN: usize = 6;

/// Message id of a fire-and-forget request (client to server) and of a
/// broadcast or push (server to client). No response is ever correlated to it.
pub const NO_RESPONSE_MESSAGE_ID: i16 = -1;

/// Message id carried by heartbeat frames; the sequence lives in the payload.
pub const HEARTBEAT_MESSAGE_ID: i16 = 0;

/// Highest message id in the client-result range.
///
/// Client-result calls use negative ids `CLIENT_RESULT_MAX_ID..=i16::MIN` so a
/// client can tell them apart from responses to its own requests.
pub const CLIENT_RESULT_MAX_ID: i16 = -2;

/// Number of distinct client-result message ids.
pub const CLIENT_RESULT_ID_SPACE: usize = (CLIENT_RESULT_MAX_ID as i32 - i16::MIN as i32 + 1) as usize;

/// Reserved method id of an error frame.
pub const ERROR_METHOD_ID: i32 = -1;

/// Reserved method id of a server heartbeat and its ack.
pub const SERVER_HEARTBEAT_METHOD_ID: i32 = -2;

/// Reserved method id of a client heartbeat and its echo.
pub const CLIENT_HEARTBEAT_METHOD_ID: i32 = -3;

/// All method ids the protocol reserves for itself.
pub const RESERVED_METHOD_IDS: [i32; 3] = [
    ERROR_METHOD_ID,
    SERVER_HEARTBEAT_METHOD_ID,
    CLIENT_HEARTBEAT_METHOD_ID,
];

/// Whether a method id collides with a protocol-reserved id.
pub fn is_reserved_method_id(method_id: i32) -> bool {
    RESERVED_METHOD_IDS.contains(&method_id)
}

/// Whether a message id falls in the client-result range.
pub fn is_client_result_message_id(message_id: i16) -> bool {
    message_id <= CLIENT_RESULT_MAX_ID
}
