//! End-to-end tests: a hub serving in-memory and length-delimited transports.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use hubwire_core::frame::{write_client_heartbeat, write_heartbeat_ack};
use hubwire_core::{
    ConnectionId, ErrorPayload, FrameCodec, JsonSerializer, ReceiverMethod, Reliability, ServerFrame, StatusCode,
    method_id,
};
use hubwire_server::transport::framed;
use hubwire_server::transport::memory::{MemoryClient, duplex, duplex_with_secondary};
use hubwire_server::{
    DisconnectReason, GroupStoreKind, HeartbeatMetadataProvider, HeartbeatOptions, Hub, HubBuilder, HubCallContext,
    HubError, HubLifecycle, HubOptions, handler_fn, void_handler_fn,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

type Ctx = HubCallContext<JsonSerializer>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ── helpers ─────────────────────────────────────────────────────────

fn quiet_options() -> HubOptions {
    HubOptions {
        heartbeat: HeartbeatOptions {
            enabled: false,
            ..HeartbeatOptions::default()
        },
        ..HubOptions::default()
    }
}

fn heartbeat_options(interval_ms: u64, timeout_ms: Option<u64>) -> HubOptions {
    HubOptions {
        heartbeat: HeartbeatOptions {
            enabled: true,
            interval_ms,
            timeout_ms,
        },
        ..HubOptions::default()
    }
}

/// A chat-style hub used by most tests.
fn chat_hub(options: HubOptions) -> HubBuilder<JsonSerializer> {
    Hub::builder()
        .options(options)
        .method("Add", handler_fn(|_ctx: Ctx, (a, b): (i32, i32)| async move { Ok(a + b) }))
        .method("Whoami", handler_fn(|ctx: Ctx, (): ()| async move { Ok(ctx.connection_id()) }))
        .method(
            "Join",
            void_handler_fn(|ctx: Ctx, room: String| async move {
                let _ = ctx.join(&room);
                Ok(())
            }),
        )
        .method(
            "Leave",
            void_handler_fn(|ctx: Ctx, room: String| async move {
                let _ = ctx.leave(&room);
                Ok(())
            }),
        )
        .method(
            "Say",
            handler_fn(|ctx: Ctx, (room, text): (String, String)| async move {
                ctx.broadcast_except_self(&room, method_id("OnSay"), &text)
            }),
        )
        .method(
            "Shout",
            handler_fn(|ctx: Ctx, (room, text): (String, String)| async move {
                ctx.broadcast(&room, method_id("OnSay"), &text)
            }),
        )
        .method(
            "Notify",
            void_handler_fn(|ctx: Ctx, text: String| async move {
                let _ = ctx.push(method_id("OnNotice"), &text)?;
                Ok(())
            }),
        )
        .method(
            "Missing",
            handler_fn(|_ctx: Ctx, (): ()| async move {
                Err::<(), _>(HubError::status(StatusCode::NotFound, "room missing"))
            }),
        )
        .method(
            "Broken",
            handler_fn(|_ctx: Ctx, (): ()| async move { Err::<(), _>(HubError::internal("db down")) }),
        )
        .method(
            "Explode",
            handler_fn(|_ctx: Ctx, fail: bool| async move {
                assert!(!fail, "kaboom");
                Ok(())
            }),
        )
        .method(
            "Confirm",
            handler_fn(|ctx: Ctx, question: String| async move {
                let outcome = ctx.client_result::<String, bool>(method_id("OnConfirm"), &question).await;
                Ok(match outcome {
                    Ok(answer) => format!("ok:{answer}"),
                    Err(HubError::ClientResult { code, detail, .. }) => format!("error:{code}:{detail}"),
                    Err(HubError::ClientResultTimeout(_)) => "timeout".to_owned(),
                    Err(err) => format!("other:{}", err.kind()),
                })
            }),
        )
}

struct TestClient {
    inner: MemoryClient,
    codec: FrameCodec<JsonSerializer>,
    next_id: i16,
}

impl TestClient {
    fn new(inner: MemoryClient) -> Self {
        Self {
            inner,
            codec: FrameCodec::new(JsonSerializer),
            next_id: 0,
        }
    }

    async fn send_raw(&self, frame: Bytes) {
        self.inner.send(frame).await.unwrap();
    }

    /// Send a request and return its message id.
    async fn request<T: Serialize + ?Sized>(&mut self, method: &str, value: &T) -> i16 {
        self.next_id += 1;
        let id = self.next_id;
        let frame = self.codec.write_request(method_id(method), id, value).unwrap();
        self.send_raw(frame).await;
        id
    }

    async fn fire<T: Serialize + ?Sized>(&self, method: &str, value: &T) {
        let frame = self.codec.write_fire_and_forget(method_id(method), value).unwrap();
        self.send_raw(frame).await;
    }

    async fn recv(&mut self) -> ServerFrame {
        tokio::time::timeout(RECV_TIMEOUT, self.inner.recv_frame())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream closed")
            .expect("malformed server frame")
    }

    /// Send a request and decode its successful response.
    async fn call<T: Serialize + ?Sized, R: DeserializeOwned>(&mut self, method: &str, value: &T) -> R {
        let id = self.request(method, value).await;
        match self.recv().await {
            ServerFrame::Response {
                message_id, payload, ..
            } => {
                assert_eq!(message_id, id);
                self.codec.decode(&payload).unwrap()
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    /// Send a request to a method that returns nothing.
    async fn call_void<T: Serialize + ?Sized>(&mut self, method: &str, value: &T) {
        let id = self.request(method, value).await;
        assert_matches!(
            self.recv().await,
            ServerFrame::Response { message_id, payload, .. } if message_id == id && payload.is_empty()
        );
    }

    /// Send a request and decode the error frame it produces.
    async fn call_err<T: Serialize + ?Sized>(&mut self, method: &str, value: &T) -> ErrorPayload {
        let id = self.request(method, value).await;
        match self.recv().await {
            ServerFrame::Error { message_id, payload } => {
                assert_eq!(message_id, id);
                self.codec.decode_error(&payload).unwrap()
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    async fn expect_broadcast<R: DeserializeOwned>(&mut self, method: &str) -> R {
        match self.recv().await {
            ServerFrame::Broadcast { method_id: id, payload } => {
                assert_eq!(id, method_id(method));
                self.codec.decode(&payload).unwrap()
            }
            other => panic!("expected broadcast, got {other:?}"),
        }
    }
}

fn connect(hub: &Hub) -> (TestClient, JoinHandle<DisconnectReason>) {
    let (transport, client) = duplex(64);
    (TestClient::new(client), hub.spawn(transport))
}

async fn finished(handle: JoinHandle<DisconnectReason>) -> DisconnectReason {
    tokio::time::timeout(RECV_TIMEOUT, handle)
        .await
        .expect("session did not end")
        .unwrap()
}

// ── request / response ──────────────────────────────────────────────

#[tokio::test]
async fn request_gets_response() {
    let hub = chat_hub(quiet_options()).build().unwrap();
    let (mut client, _session) = connect(&hub);

    let sum: i32 = client.call("Add", &(2, 3)).await;
    assert_eq!(sum, 5);
}

#[tokio::test]
async fn void_method_writes_empty_response() {
    let hub = chat_hub(quiet_options()).build().unwrap();
    let (mut client, _session) = connect(&hub);

    let id = client.request("Join", "lobby").await;
    assert_matches!(
        client.recv().await,
        ServerFrame::Response { message_id, payload, .. } if message_id == id && payload.is_empty()
    );
}

#[tokio::test]
async fn responses_follow_request_order() {
    let hub = chat_hub(quiet_options()).build().unwrap();
    let (mut client, _session) = connect(&hub);

    let first = client.request("Add", &(1, 1)).await;
    let second = client.request("Add", &(2, 2)).await;
    assert_matches!(client.recv().await, ServerFrame::Response { message_id, .. } if message_id == first);
    assert_matches!(client.recv().await, ServerFrame::Response { message_id, .. } if message_id == second);
}

#[tokio::test]
async fn fire_and_forget_never_answers() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let hub = chat_hub(quiet_options())
        .method(
            "Track",
            void_handler_fn(move |_ctx: Ctx, (): ()| {
                let counted = Arc::clone(&counted);
                async move {
                    let _ = counted.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .build()
        .unwrap();
    let (mut client, _session) = connect(&hub);

    client.fire("Track", &()).await;
    client.fire("Broken", &()).await;
    client.fire("NoSuchMethod", &()).await;

    // Requests run in order, so the response proves the earlier calls finished.
    let sum: i32 = client.call("Add", &(1, 2)).await;
    assert_eq!(sum, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(client.inner.try_recv().is_none());
}

// ── error mapping ───────────────────────────────────────────────────

#[tokio::test]
async fn unknown_method_is_unimplemented() {
    let hub = chat_hub(quiet_options()).build().unwrap();
    let (mut client, _session) = connect(&hub);

    let id = 7;
    let frame = client.codec.write_request(12345, id, &()).unwrap();
    client.send_raw(frame).await;
    let ServerFrame::Error { message_id, payload } = client.recv().await else {
        panic!("expected error frame");
    };
    assert_eq!(message_id, id);
    let error = client.codec.decode_error(&payload).unwrap();
    assert_eq!(error.code, StatusCode::Unimplemented);
    assert_eq!(error.detail, "Method '12345' is not found in hub.");
}

#[tokio::test]
async fn status_error_passes_through() {
    let hub = chat_hub(quiet_options()).build().unwrap();
    let (mut client, _session) = connect(&hub);

    let error = client.call_err("Missing", &()).await;
    assert_eq!(error.code, StatusCode::NotFound);
    assert_eq!(error.detail, "room missing");
    assert!(error.message.is_none());
}

#[tokio::test]
async fn internal_error_hides_message_by_default() {
    let hub = chat_hub(quiet_options()).build().unwrap();
    let (mut client, _session) = connect(&hub);

    let error = client.call_err("Broken", &()).await;
    assert_eq!(error.code, StatusCode::Internal);
    assert_eq!(error.detail, "An error occurred while processing handler 'Broken'.");
    assert!(error.message.is_none());
}

#[tokio::test]
async fn internal_error_message_when_detail_enabled() {
    let options = HubOptions {
        return_error_detail: true,
        ..quiet_options()
    };
    let hub = chat_hub(options).build().unwrap();
    let (mut client, _session) = connect(&hub);

    let error = client.call_err("Broken", &()).await;
    assert_eq!(error.code, StatusCode::Internal);
    assert_eq!(error.message.as_deref(), Some("db down"));
}

#[tokio::test]
async fn invalid_payload_is_invalid_argument() {
    let hub = chat_hub(quiet_options()).build().unwrap();
    let (mut client, _session) = connect(&hub);

    let error = client.call_err("Add", "not a pair").await;
    assert_eq!(error.code, StatusCode::InvalidArgument);
    assert_eq!(error.detail, "Invalid payload for handler 'Add'.");
}

#[tokio::test]
async fn panic_becomes_error_and_connection_survives() {
    let options = HubOptions {
        return_error_detail: true,
        ..quiet_options()
    };
    let hub = chat_hub(options).build().unwrap();
    let (mut client, _session) = connect(&hub);

    let error = client.call_err("Explode", &true).await;
    assert_eq!(error.code, StatusCode::Internal);
    assert_eq!(error.message.as_deref(), Some("handler panicked: kaboom"));

    let sum: i32 = client.call("Add", &(4, 4)).await;
    assert_eq!(sum, 8);
}

#[tokio::test]
async fn malformed_frame_closes_connection() {
    let hub = chat_hub(quiet_options()).build().unwrap();
    let (client, session) = connect(&hub);

    client.send_raw(Bytes::from_static(&[0, 1, 2])).await;
    assert_matches!(finished(session).await, DisconnectReason::MalformedFrame(_));
    assert_eq!(hub.connection_count(), 0);
}

// ── heartbeats ──────────────────────────────────────────────────────

#[tokio::test]
async fn client_heartbeat_is_echoed() {
    let hub = chat_hub(quiet_options()).build().unwrap();
    let (mut client, _session) = connect(&hub);

    client.send_raw(write_client_heartbeat(9, 1_700_000_000_000, b"ping")).await;
    assert_eq!(
        client.recv().await,
        ServerFrame::ClientHeartbeatEcho {
            sequence: 9,
            client_sent_at: 1_700_000_000_000,
            extra: Bytes::from_static(b"ping"),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn acked_heartbeats_keep_connection_alive() {
    let hub = chat_hub(heartbeat_options(1_000, Some(3_000))).build().unwrap();
    let (mut client, session) = connect(&hub);

    for expected in 0..6 {
        let ServerFrame::Heartbeat { sequence, .. } = client.recv().await else {
            panic!("expected heartbeat");
        };
        assert_eq!(sequence, expected);
        client.send_raw(write_heartbeat_ack(sequence)).await;
    }

    assert!(!session.is_finished());
    let id = hub.connection_ids()[0];
    let handle = hub.heartbeat().get(id).unwrap();
    assert!(handle.latency().is_some());
    assert!(!handle.is_timed_out());
}

#[tokio::test(start_paused = true)]
async fn missing_ack_times_out() {
    let hub = chat_hub(heartbeat_options(1_000, Some(3_000))).build().unwrap();
    let (mut client, session) = connect(&hub);

    assert_matches!(client.recv().await, ServerFrame::Heartbeat { sequence: 0, .. });
    assert_eq!(finished(session).await, DisconnectReason::HeartbeatTimeout);
    assert_eq!(hub.connection_count(), 0);
    assert_eq!(hub.heartbeat().registered_count(), 0);
    assert!(!hub.heartbeat().is_timer_running());
}

#[tokio::test(start_paused = true)]
async fn heartbeat_carries_metadata() {
    struct Version;
    impl HeartbeatMetadataProvider for Version {
        fn write_metadata(&self, buf: &mut BytesMut) -> bool {
            buf.extend_from_slice(b"v1");
            true
        }
    }

    let hub = chat_hub(heartbeat_options(1_000, None))
        .heartbeat_metadata(Version)
        .build()
        .unwrap();
    let (mut client, _session) = connect(&hub);

    let ServerFrame::Heartbeat { metadata, server_sent_at, .. } = client.recv().await else {
        panic!("expected heartbeat");
    };
    assert_eq!(&metadata[..], b"v1");
    assert!(server_sent_at > 0);
}

// ── groups and broadcasts ───────────────────────────────────────────

#[tokio::test]
async fn broadcast_targeting_on_both_stores() {
    for store in [GroupStoreKind::Concurrent, GroupStoreKind::Snapshot] {
        let options = HubOptions {
            group_store: store,
            ..quiet_options()
        };
        let hub = chat_hub(options).build().unwrap();
        let (mut alice, _a) = connect(&hub);
        let (mut bob, _b) = connect(&hub);
        let (mut carol, _c) = connect(&hub);

        for client in [&mut alice, &mut bob, &mut carol] {
            client.call_void("Join", "room").await;
        }
        assert_eq!(hub.broadcaster().count("room"), 3, "{store:?}");

        let queued: usize = alice.call("Say", &("room", "hi")).await;
        assert_eq!(queued, 2, "{store:?}");
        assert_eq!(bob.expect_broadcast::<String>("OnSay").await, "hi");
        assert_eq!(carol.expect_broadcast::<String>("OnSay").await, "hi");
        assert!(alice.inner.try_recv().is_none(), "{store:?}");

        // The caller's own copy is queued before its response.
        let id = bob.request("Shout", &("room", "all")).await;
        assert_eq!(bob.expect_broadcast::<String>("OnSay").await, "all");
        let ServerFrame::Response { message_id, payload, .. } = bob.recv().await else {
            panic!("expected response");
        };
        assert_eq!(message_id, id);
        assert_eq!(bob.codec.decode::<usize>(&payload).unwrap(), 3, "{store:?}");
        for client in [&mut alice, &mut carol] {
            assert_eq!(client.expect_broadcast::<String>("OnSay").await, "all");
        }
    }
}

#[tokio::test]
async fn broadcast_to_listed_members_from_outside_a_call() {
    let hub = chat_hub(quiet_options()).build().unwrap();
    let (mut alice, _a) = connect(&hub);
    let (mut bob, _b) = connect(&hub);
    alice.call_void("Join", "room").await;
    bob.call_void("Join", "room").await;
    let bob_id: ConnectionId = bob.call("Whoami", &()).await;

    let queued = hub.broadcaster().broadcast_to("room", &[bob_id], method_id("OnSay"), "psst").unwrap();
    assert_eq!(queued, 1);
    assert_eq!(bob.expect_broadcast::<String>("OnSay").await, "psst");
    assert!(alice.inner.try_recv().is_none());
}

#[tokio::test]
async fn leaving_a_group_stops_broadcasts() {
    let hub = chat_hub(quiet_options()).build().unwrap();
    let (mut alice, _a) = connect(&hub);
    let (mut bob, _b) = connect(&hub);
    alice.call_void("Join", "room").await;
    bob.call_void("Join", "room").await;
    bob.call_void("Leave", "room").await;

    let queued: usize = alice.call("Say", &("room", "anyone?")).await;
    assert_eq!(queued, 0);
    assert!(bob.inner.try_recv().is_none());
}

#[tokio::test]
async fn push_reaches_only_the_caller() {
    let hub = chat_hub(quiet_options()).build().unwrap();
    let (mut alice, _a) = connect(&hub);

    let id = alice.request("Notify", "welcome").await;
    assert_eq!(alice.expect_broadcast::<String>("OnNotice").await, "welcome");
    assert_matches!(alice.recv().await, ServerFrame::Response { message_id, .. } if message_id == id);
}

#[tokio::test]
async fn client_proxy_invokes_receiver() {
    let hub = chat_hub(quiet_options()).build().unwrap();
    let (mut alice, _a) = connect(&hub);
    let id: ConnectionId = alice.call("Whoami", &()).await;

    let proxy = hub.client(id).unwrap();
    assert!(proxy.is_connected());
    assert!(proxy.invoke(method_id("OnNotice"), "direct").unwrap());
    assert_eq!(alice.expect_broadcast::<String>("OnNotice").await, "direct");
    assert!(hub.client(ConnectionId::new()).is_none());
}

#[tokio::test]
async fn unreliable_receivers_use_secondary_channel() {
    let hub = chat_hub(quiet_options())
        .receiver(ReceiverMethod::new("OnPosition").with_reliability(Reliability::Unreliable))
        .receiver(ReceiverMethod::new("OnSay"))
        .build()
        .unwrap();
    let (transport, inner) = duplex_with_secondary(64);
    let _session = hub.spawn(transport);
    let mut client = TestClient::new(inner);
    client.call_void("Join", "room").await;

    let _ = hub.broadcaster().broadcast_all("room", method_id("OnPosition"), &(1, 2)).unwrap();
    let _ = hub.broadcaster().broadcast_all("room", method_id("OnSay"), "hello").unwrap();

    let lossy = tokio::time::timeout(RECV_TIMEOUT, client.inner.recv_secondary())
        .await
        .unwrap()
        .unwrap();
    assert_matches!(
        ServerFrame::parse(lossy).unwrap(),
        ServerFrame::Broadcast { method_id: id, .. } if id == method_id("OnPosition")
    );
    assert_eq!(client.expect_broadcast::<String>("OnSay").await, "hello");
}

#[tokio::test]
async fn unencodable_response_is_internal() {
    let hub = chat_hub(quiet_options())
        .method(
            "Grid",
            handler_fn(|_ctx: Ctx, (): ()| async move { Ok(std::collections::HashMap::from([((0, 0), 1)])) }),
        )
        .build()
        .unwrap();
    let (mut client, _session) = connect(&hub);

    let err = client.call_err("Grid", &()).await;
    assert_eq!(err.code, StatusCode::Internal);
    assert_eq!(err.detail, "An error occurred while processing handler 'Grid'.");
    // The connection keeps serving.
    let sum: i32 = client.call("Add", &(2, 2)).await;
    assert_eq!(sum, 4);
}

// ── client results ──────────────────────────────────────────────────

#[tokio::test]
async fn client_result_round_trip() {
    let hub = chat_hub(quiet_options()).build().unwrap();
    let (mut client, _session) = connect(&hub);

    let request_id = client.request("Confirm", "delete?").await;
    let ServerFrame::ClientResultRequest {
        method_id: receiver,
        message_id,
        payload,
    } = client.recv().await
    else {
        panic!("expected client result request");
    };
    assert_eq!(receiver, method_id("OnConfirm"));
    assert!(message_id <= -2);
    assert_eq!(client.codec.decode::<String>(&payload).unwrap(), "delete?");

    let reply = client.codec.write_client_result_reply(receiver, message_id, &true).unwrap();
    client.send_raw(reply).await;

    let ServerFrame::Response { message_id, payload, .. } = client.recv().await else {
        panic!("expected response");
    };
    assert_eq!(message_id, request_id);
    assert_eq!(client.codec.decode::<String>(&payload).unwrap(), "ok:true");
}

#[tokio::test]
async fn client_result_error_reaches_handler() {
    let hub = chat_hub(quiet_options()).build().unwrap();
    let (mut client, _session) = connect(&hub);

    let _ = client.request("Confirm", "delete?").await;
    let ServerFrame::ClientResultRequest { message_id, .. } = client.recv().await else {
        panic!("expected client result request");
    };
    let reply = client
        .codec
        .write_client_result_error(message_id, StatusCode::PermissionDenied, "user declined", None)
        .unwrap();
    client.send_raw(reply).await;

    let ServerFrame::Response { payload, .. } = client.recv().await else {
        panic!("expected response");
    };
    assert_eq!(
        client.codec.decode::<String>(&payload).unwrap(),
        "error:PERMISSION_DENIED:user declined"
    );
}

#[tokio::test(start_paused = true)]
async fn client_result_times_out() {
    let options = HubOptions {
        client_result_timeout_ms: Some(500),
        ..quiet_options()
    };
    let hub = chat_hub(options).build().unwrap();
    let (mut client, _session) = connect(&hub);

    let _ = client.request("Confirm", "delete?").await;
    assert_matches!(client.recv().await, ServerFrame::ClientResultRequest { .. });

    let ServerFrame::Response { payload, .. } = client.recv().await else {
        panic!("expected response");
    };
    assert_eq!(client.codec.decode::<String>(&payload).unwrap(), "timeout");
}

#[tokio::test]
async fn teardown_cancels_outstanding_client_results() {
    let options = HubOptions {
        client_result_timeout_ms: None,
        ..quiet_options()
    };
    let hub = chat_hub(options).build().unwrap();
    let (mut client, session) = connect(&hub);

    let _ = client.request("Confirm", "delete?").await;
    assert_matches!(client.recv().await, ServerFrame::ClientResultRequest { .. });
    client.inner.close();

    // The handler observes the cancellation and its response is still flushed.
    let ServerFrame::Response { payload, .. } = client.recv().await else {
        panic!("expected response");
    };
    assert_eq!(
        client.codec.decode::<String>(&payload).unwrap(),
        "other:pending_result_cancelled"
    );
    assert_eq!(finished(session).await, DisconnectReason::ClientClosed);
}

#[tokio::test]
async fn stray_client_result_reply_is_ignored() {
    let hub = chat_hub(quiet_options()).build().unwrap();
    let (mut client, _session) = connect(&hub);

    let stray = client.codec.write_client_result_reply(method_id("OnConfirm"), -42, &true).unwrap();
    client.send_raw(stray).await;
    let sum: i32 = client.call("Add", &(1, 1)).await;
    assert_eq!(sum, 2);
}

// ── lifecycle and teardown ──────────────────────────────────────────

#[tokio::test]
async fn disconnect_removes_connection_from_groups() {
    let hub = chat_hub(quiet_options()).build().unwrap();
    let (mut client, session) = connect(&hub);
    client.call_void("Join", "a").await;
    client.call_void("Join", "b").await;
    let mut groups = hub.broadcaster().group_names();
    groups.sort();
    assert_eq!(groups, vec!["a".to_owned(), "b".to_owned()]);
    assert_eq!(hub.connection_count(), 1);

    client.inner.close();
    assert_eq!(finished(session).await, DisconnectReason::ClientClosed);
    assert!(hub.broadcaster().group_names().is_empty());
    assert_eq!(hub.connection_count(), 0);
}

struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
    reject: bool,
}

#[async_trait]
impl HubLifecycle<JsonSerializer> for Recorder {
    async fn on_connecting(&self, ctx: &Ctx) -> Result<(), HubError> {
        self.events.lock().push(format!("connecting:{}", ctx.method_id()));
        if self.reject {
            return Err(HubError::status(StatusCode::Unauthenticated, "no token"));
        }
        Ok(())
    }

    async fn on_connected(&self, _ctx: &Ctx) -> Result<(), HubError> {
        self.events.lock().push("connected".to_owned());
        Ok(())
    }

    async fn on_disconnected(&self, _ctx: &Ctx, reason: &DisconnectReason) -> Result<(), HubError> {
        self.events.lock().push(format!("disconnected:{}", reason.as_str()));
        Ok(())
    }
}

#[tokio::test]
async fn lifecycle_hooks_run_in_order() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let hub = chat_hub(quiet_options())
        .lifecycle(Recorder {
            events: Arc::clone(&events),
            reject: false,
        })
        .build()
        .unwrap();
    let (mut client, session) = connect(&hub);
    let _: i32 = client.call("Add", &(1, 1)).await;
    client.inner.close();
    let _ = finished(session).await;

    assert_eq!(
        *events.lock(),
        vec![
            "connecting:0".to_owned(),
            "connected".to_owned(),
            "disconnected:client_closed".to_owned(),
        ]
    );
}

#[tokio::test]
async fn rejecting_hook_refuses_connection() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let hub = chat_hub(quiet_options())
        .lifecycle(Recorder {
            events: Arc::clone(&events),
            reject: true,
        })
        .build()
        .unwrap();
    let (_client, session) = connect(&hub);

    assert_matches!(finished(session).await, DisconnectReason::Rejected(detail) if detail.contains("no token"));
    assert_eq!(hub.connection_count(), 0);
    assert_eq!(
        *events.lock(),
        vec!["connecting:0".to_owned(), "disconnected:rejected".to_owned()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn detached_joins_cannot_outlive_teardown() {
    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    let hub = chat_hub(quiet_options())
        .method(
            "Linger",
            void_handler_fn(move |ctx: Ctx, room: String| {
                let done = done_tx.clone();
                async move {
                    // Keeps joining from outside the call until the connection is gone.
                    let _task = tokio::spawn(async move {
                        while !ctx.connection().is_closed() {
                            let _ = ctx.join(&room);
                            tokio::task::yield_now().await;
                        }
                        let _ = ctx.join(&room);
                        let _ = done.send(());
                    });
                    Ok(())
                }
            }),
        )
        .build()
        .unwrap();
    let (mut client, session) = connect(&hub);
    for _ in 0..4 {
        client.call_void("Linger", "room").await;
    }

    client.inner.close();
    assert_eq!(finished(session).await, DisconnectReason::ClientClosed);
    for _ in 0..4 {
        tokio::time::timeout(RECV_TIMEOUT, done_rx.recv())
            .await
            .expect("joining task did not stop")
            .unwrap();
    }
    assert_eq!(hub.broadcaster().count("room"), 0);
    assert!(hub.broadcaster().group_names().is_empty());
}

#[tokio::test]
async fn handler_can_close_its_connection() {
    let hub = chat_hub(quiet_options())
        .method(
            "Kick",
            void_handler_fn(|ctx: Ctx, (): ()| async move {
                ctx.close();
                Ok(())
            }),
        )
        .build()
        .unwrap();
    let (mut client, session) = connect(&hub);

    let _ = client.request("Kick", &()).await;
    assert_eq!(finished(session).await, DisconnectReason::ServerClosed);
}

// ── shutdown ────────────────────────────────────────────────────────

#[tokio::test]
async fn hub_shutdown_disconnects_everyone() {
    let hub = chat_hub(heartbeat_options(60_000, None)).build().unwrap();
    let (mut alice, a) = connect(&hub);
    let (mut bob, b) = connect(&hub);
    let _: i32 = alice.call("Add", &(1, 1)).await;
    let _: i32 = bob.call("Add", &(1, 1)).await;
    assert!(hub.heartbeat().is_timer_running());

    hub.shutdown();
    assert_eq!(finished(a).await, DisconnectReason::ServerShutdown);
    assert_eq!(finished(b).await, DisconnectReason::ServerShutdown);
    assert_eq!(hub.connection_count(), 0);
    assert!(!hub.heartbeat().is_timer_running());
}

#[tokio::test]
async fn graceful_shutdown_reports_drained_sessions() {
    let hub = chat_hub(heartbeat_options(60_000, None)).build().unwrap();
    let (mut alice, a) = connect(&hub);
    let (mut bob, b) = connect(&hub);
    let alice_id: ConnectionId = alice.call("Whoami", &()).await;
    let bob_id: ConnectionId = bob.call("Whoami", &()).await;
    assert_eq!(hub.coordinator().session_count(), 2);

    let report = hub.shutdown_gracefully(Some(Duration::from_secs(5))).await;
    assert!(report.completed());
    assert_eq!(report.count(&DisconnectReason::ServerShutdown), 2);
    let mut ids: Vec<_> = report.disconnected.iter().map(|(id, _)| *id).collect();
    ids.sort();
    let mut expected = vec![alice_id, bob_id];
    expected.sort();
    assert_eq!(ids, expected);

    assert_eq!(hub.connection_count(), 0);
    assert_eq!(hub.coordinator().session_count(), 0);
    assert!(!hub.heartbeat().is_timer_running());
    assert_eq!(finished(a).await, DisconnectReason::ServerShutdown);
    assert_eq!(finished(b).await, DisconnectReason::ServerShutdown);
}

#[tokio::test]
async fn external_token_shuts_the_hub_down() {
    let token = tokio_util::sync::CancellationToken::new();
    let hub = chat_hub(quiet_options()).shutdown_token(token.clone()).build().unwrap();
    let (mut client, session) = connect(&hub);
    let _: i32 = client.call("Add", &(1, 1)).await;

    token.cancel();
    assert_eq!(finished(session).await, DisconnectReason::ServerShutdown);
    assert!(hub.coordinator().is_shutting_down());
}

// ── length-delimited transport ──────────────────────────────────────

#[tokio::test]
async fn serves_length_delimited_stream() {
    let hub = chat_hub(quiet_options()).build().unwrap();
    let (server_io, client_io) = tokio::io::duplex(4096);
    let session = hub.spawn_io(server_io);

    let codec = FrameCodec::new(JsonSerializer);
    let mut client = Framed::new(client_io, framed::codec(hub.options().max_frame_len));
    client
        .send(codec.write_request(method_id("Add"), 1, &(20, 22)).unwrap())
        .await
        .unwrap();

    let frame = tokio::time::timeout(RECV_TIMEOUT, client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let ServerFrame::Response { message_id, payload, .. } = ServerFrame::parse(frame.freeze()).unwrap() else {
        panic!("expected response");
    };
    assert_eq!(message_id, 1);
    assert_eq!(codec.decode::<i32>(&payload).unwrap(), 42);

    drop(client);
    assert_eq!(finished(session).await, DisconnectReason::ClientClosed);
}
