//! Single-request dispatch: resolve, invoke, map the outcome to a frame.
//!
//! A failing call never affects the connection. Fire-and-forget calls never
//! produce a frame, not even an error frame.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::FutureExt;
use hubwire_core::{CodecError, MessageSerializer, StatusCode};
use metrics::{counter, histogram};
use tracing::{debug, error, warn};

use super::session::ConnectionScope;
use crate::errors::HubError;
use crate::metrics::{METHOD_CALLS_TOTAL, METHOD_DURATION_SECONDS, METHOD_ERRORS_TOTAL, METHOD_NOT_FOUND_TOTAL};
use crate::rpc::context::HubCallContext;
use crate::rpc::registry::HandlerOutput;

/// Calls slower than this are logged.
const SLOW_CALL_THRESHOLD: Duration = Duration::from_secs(5);

/// Run one request and build the frame to send back, if any.
pub(crate) async fn dispatch<S: MessageSerializer>(
    scope: &Arc<ConnectionScope<S>>,
    method_id: i32,
    message_id: Option<i16>,
    payload: Bytes,
) -> Option<Bytes> {
    let shared = &scope.shared;
    let conn_id = scope.connection.id();

    let Some(method) = shared.methods.get(method_id) else {
        counter!(METHOD_NOT_FOUND_TOTAL).increment(1);
        warn!(%conn_id, method_id, "method not found");
        let detail = format!("Method '{method_id}' is not found in hub.");
        return message_id.and_then(|id| error_frame(scope, id, StatusCode::Unimplemented, &detail, None));
    };

    let name = Arc::clone(&method.name);
    counter!(METHOD_CALLS_TOTAL, "method" => name.to_string()).increment(1);
    debug!(%conn_id, method = %name, method_id, ?message_id, "hub method begin");

    let ctx = HubCallContext::new(Arc::clone(scope), method_id, message_id);
    let started = Instant::now();
    let outcome = AssertUnwindSafe(method.handler.call(ctx, payload)).catch_unwind().await;
    let elapsed = started.elapsed();
    let result = outcome.unwrap_or_else(|panic| Err(HubError::internal(panic_message(panic.as_ref()))));

    histogram!(METHOD_DURATION_SECONDS, "method" => name.to_string()).record(elapsed.as_secs_f64());
    debug!(
        %conn_id,
        method = %name,
        elapsed_ms = elapsed.as_millis() as u64,
        is_error = result.is_err(),
        "hub method end"
    );
    if elapsed >= SLOW_CALL_THRESHOLD {
        warn!(%conn_id, method = %name, duration_secs = elapsed.as_secs_f64(), "slow hub method");
    }

    match result {
        Ok(output) => {
            let id = message_id?;
            Some(match output {
                HandlerOutput::Value(body) => body.into_frame(method_id, id),
                HandlerOutput::Void => shared.codec.write_response_void(method_id, id),
            })
        }
        Err(err) => {
            counter!(METHOD_ERRORS_TOTAL, "method" => name.to_string(), "error_type" => err.kind()).increment(1);
            let (code, detail, message) = map_error(&name, &err, shared.options.return_error_detail);
            match &err {
                HubError::Status { .. } => debug!(%conn_id, method = %name, %code, "hub method returned status"),
                HubError::Codec(CodecError::Serialize(_)) => {
                    error!(%conn_id, method = %name, error = %err, "failed to encode hub method output");
                }
                HubError::Codec(_) => warn!(%conn_id, method = %name, error = %err, "invalid payload"),
                _ => error!(%conn_id, method = %name, error = %err, "hub method failed"),
            }
            message_id.and_then(|id| error_frame(scope, id, code, &detail, message.as_deref()))
        }
    }
}

/// Status, detail and optional message for a handler error.
///
/// Decode failures blame the caller's payload. Encode failures are the
/// server's own and map to `Internal`.
pub(crate) fn map_error(name: &str, err: &HubError, return_detail: bool) -> (StatusCode, String, Option<String>) {
    let message = return_detail.then(|| err.to_string());
    match err {
        HubError::Status { code, detail } => (*code, detail.clone(), None),
        HubError::Codec(codec) if !matches!(codec, CodecError::Serialize(_)) => (
            StatusCode::InvalidArgument,
            format!("Invalid payload for handler '{name}'."),
            message,
        ),
        _ => (
            StatusCode::Internal,
            format!("An error occurred while processing handler '{name}'."),
            message,
        ),
    }
}

fn error_frame<S: MessageSerializer>(
    scope: &ConnectionScope<S>,
    message_id: i16,
    code: StatusCode,
    detail: &str,
    message: Option<&str>,
) -> Option<Bytes> {
    match scope.shared.codec.write_error(message_id, code, detail, message) {
        Ok(frame) => Some(frame),
        Err(err) => {
            error!(conn_id = %scope.connection.id(), message_id, error = %err, "failed to encode error frame");
            None
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_owned()
    }
}
