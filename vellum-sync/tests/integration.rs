//! Integration tests for the end-to-end transport pipeline.
//!
//! These tests start a real server on an ephemeral port and connect
//! real clients, pinning every transport guarantee over actual
//! sockets: the sync-step scenario byte-for-byte, fault isolation,
//! ordering, and both shutdown modes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;

use vellum_sync::{
    encode_frame, Connection, Handshake, HandlerRegistry, LifecycleState, MessageType, Reply,
    ServerConfig, SessionError, SessionHooks, ShutdownMode, SyncClient, SyncServer,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Start a server with the given hooks on an ephemeral port.
async fn start_server<H: SessionHooks>(hooks: H) -> (Arc<SyncServer>, String) {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(SyncServer::new(ServerConfig::default(), hooks));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, format!("ws://{addr}"))
}

/// Registers a sync handshake step plus a ping/pong liveness pair.
struct StepHooks {
    reply_payload: Vec<u8>,
}

impl SessionHooks for StepHooks {
    fn on_connect(
        &self,
        _conn: &Arc<Connection>,
        _handshake: &Handshake,
        registry: &mut HandlerRegistry,
    ) -> Result<(), SessionError> {
        let reply = self.reply_payload.clone();
        registry.register(MessageType::SyncStep1, move |_payload| {
            let reply = reply.clone();
            async move { Ok(Some(Reply::new(MessageType::SyncStep2, reply))) }
        })?;
        registry.register(MessageType::Ping, |payload| async move {
            Ok(Some(Reply::new(MessageType::Pong, payload)))
        })?;
        Ok(())
    }
}

#[tokio::test]
async fn test_scenario_sync_step_roundtrip() {
    let payload_x = vec![1, 2, 3];
    let payload_y = vec![40, 41, 42];
    let (_server, url) = start_server(StepHooks {
        reply_payload: payload_y.clone(),
    })
    .await;

    let mut client = SyncClient::connect(&url, "abc").await.unwrap();
    assert_eq!(client.doc_id(), "abc");

    client.send(MessageType::SyncStep1, &payload_x).unwrap();

    let (tag, payload) = timeout(Duration::from_secs(2), client.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tag, MessageType::SyncStep2.tag());
    assert_eq!(payload, payload_y);
}

#[tokio::test]
async fn test_scenario_exact_wire_bytes() {
    let payload_x = vec![9, 9, 9];
    let payload_y = vec![7, 7];
    let (_server, url) = start_server(StepHooks {
        reply_payload: payload_y.clone(),
    })
    .await;

    // Raw socket: the reply must be exactly encode_frame(3, payload_y).
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}/abc"))
        .await
        .unwrap();
    ws.send(Message::Binary(encode_frame(2, &payload_x).into()))
        .await
        .unwrap();

    let reply = loop {
        match timeout(Duration::from_secs(2), ws.next()).await.unwrap() {
            Some(Ok(Message::Binary(data))) => break data,
            Some(Ok(_)) => continue,
            other => panic!("expected binary reply, got {other:?}"),
        }
    };
    let bytes: Vec<u8> = reply.into();
    assert_eq!(bytes, encode_frame(3, &payload_y));
}

#[tokio::test]
async fn test_unknown_type_preserves_connection() {
    let (server, url) = start_server(StepHooks {
        reply_payload: vec![],
    })
    .await;

    let mut client = SyncClient::connect(&url, "abc").await.unwrap();

    // Well-formed frame, tag far outside the closed set.
    client.send_raw(encode_frame(99, &[1, 2, 3])).unwrap();
    // Known tag with no handler registered for this session.
    client.send_raw(encode_frame(4, &[1])).unwrap();

    // The session survives and still answers.
    client.send(MessageType::Ping, &[5]).unwrap();
    let (tag, payload) = timeout(Duration::from_secs(2), client.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tag, MessageType::Pong.tag());
    assert_eq!(payload, vec![5]);
    assert_eq!(server.stats().dispatch.unknown_types, 2);
}

#[tokio::test]
async fn test_malformed_frame_preserves_connection() {
    let (server, url) = start_server(StepHooks {
        reply_payload: vec![],
    })
    .await;

    let mut client = SyncClient::connect(&url, "abc").await.unwrap();

    // Empty frame, then a truncated varint (continuation bit, no end).
    client.send_raw(Vec::new()).unwrap();
    client.send_raw(vec![0x80, 0x80]).unwrap();

    client.send(MessageType::Ping, &[1]).unwrap();
    let (tag, _) = timeout(Duration::from_secs(2), client.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tag, MessageType::Pong.tag());
    assert_eq!(server.stats().dispatch.malformed_frames, 2);
}

/// Records update payload heads in handler completion order; the first
/// frame's handler is deliberately the slowest.
struct OrderHooks {
    order: Arc<Mutex<Vec<u8>>>,
}

impl SessionHooks for OrderHooks {
    fn on_connect(
        &self,
        _conn: &Arc<Connection>,
        _handshake: &Handshake,
        registry: &mut HandlerRegistry,
    ) -> Result<(), SessionError> {
        let order = self.order.clone();
        registry.register(MessageType::Update, move |payload| {
            let order = order.clone();
            async move {
                if payload[0] == 0 {
                    sleep(Duration::from_millis(150)).await;
                }
                order.lock().unwrap().push(payload[0]);
                Ok(None)
            }
        })?;
        Ok(())
    }
}

#[tokio::test]
async fn test_per_connection_ordering() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let (_server, url) = start_server(OrderHooks { order: order.clone() }).await;

    let client = SyncClient::connect(&url, "abc").await.unwrap();
    for i in 0u8..4 {
        client.send(MessageType::Update, &[i]).unwrap();
    }

    for _ in 0..100 {
        if order.lock().unwrap().len() == 4 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    // Handler latency on frame 0 must not let frames 1..3 overtake it.
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
}

/// Hangs update handlers for the "slow" document only.
struct SlowDocHooks;

impl SessionHooks for SlowDocHooks {
    fn on_connect(
        &self,
        conn: &Arc<Connection>,
        _handshake: &Handshake,
        registry: &mut HandlerRegistry,
    ) -> Result<(), SessionError> {
        let slow = conn.doc_id() == "slow";
        registry.register(MessageType::Update, move |_payload| async move {
            if slow {
                sleep(Duration::from_secs(5)).await;
            }
            Ok(None)
        })?;
        registry.register(MessageType::Ping, |payload| async move {
            Ok(Some(Reply::new(MessageType::Pong, payload)))
        })?;
        Ok(())
    }
}

#[tokio::test]
async fn test_cross_connection_independence() {
    let (_server, url) = start_server(SlowDocHooks).await;

    // Connection A wedges its own dispatch loop in a 5s handler.
    let client_a = SyncClient::connect(&url, "slow").await.unwrap();
    client_a.send(MessageType::Update, &[0]).unwrap();
    sleep(Duration::from_millis(50)).await;

    // Connection B must be completely unaffected.
    let mut client_b = SyncClient::connect(&url, "fast").await.unwrap();
    client_b.send(MessageType::Ping, &[1]).unwrap();
    let (tag, _) = timeout(Duration::from_millis(500), client_b.recv())
        .await
        .expect("dispatch on B must not wait for A's handler")
        .unwrap();
    assert_eq!(tag, MessageType::Pong.tag());
}

/// Update always fails; ping still answers.
struct FailingHooks;

impl SessionHooks for FailingHooks {
    fn on_connect(
        &self,
        _conn: &Arc<Connection>,
        _handshake: &Handshake,
        registry: &mut HandlerRegistry,
    ) -> Result<(), SessionError> {
        registry.register(MessageType::Update, |_payload| async {
            Err("merge store unavailable".into())
        })?;
        registry.register(MessageType::Ping, |payload| async move {
            Ok(Some(Reply::new(MessageType::Pong, payload)))
        })?;
        Ok(())
    }
}

#[tokio::test]
async fn test_handler_failure_isolation() {
    let (server, url) = start_server(FailingHooks).await;

    let mut client = SyncClient::connect(&url, "abc").await.unwrap();
    client.send(MessageType::Update, &[1]).unwrap();

    // The failed handler produced no reply and no disconnect.
    client.send(MessageType::Ping, &[2]).unwrap();
    let (tag, payload) = timeout(Duration::from_secs(2), client.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tag, MessageType::Pong.tag());
    assert_eq!(payload, vec![2]);
    assert_eq!(server.stats().dispatch.handler_failures, 1);
}

/// Broken connect hook: registers the same type twice.
struct DuplicateHooks;

impl SessionHooks for DuplicateHooks {
    fn on_connect(
        &self,
        _conn: &Arc<Connection>,
        _handshake: &Handshake,
        registry: &mut HandlerRegistry,
    ) -> Result<(), SessionError> {
        registry.register(MessageType::Update, |_payload| async { Ok(None) })?;
        registry.register(MessageType::Update, |_payload| async { Ok(None) })?;
        Ok(())
    }
}

#[tokio::test]
async fn test_duplicate_registration_aborts_session() {
    let (server, url) = start_server(DuplicateHooks).await;

    // The upgrade succeeds, but the session dies before dispatch.
    let mut client = SyncClient::connect(&url, "abc").await.unwrap();
    let gone = timeout(Duration::from_secs(2), client.recv()).await.unwrap();
    assert!(gone.is_none(), "session must close on setup failure");
    assert_eq!(server.stats().dispatch.frames_dispatched, 0);
}

/// Captures the connection handle and handshake for inspection.
#[derive(Default)]
struct CaptureHooks {
    conn: Arc<Mutex<Option<Arc<Connection>>>>,
    handshake: Arc<Mutex<Option<Handshake>>>,
}

impl SessionHooks for CaptureHooks {
    fn on_connect(
        &self,
        conn: &Arc<Connection>,
        handshake: &Handshake,
        registry: &mut HandlerRegistry,
    ) -> Result<(), SessionError> {
        *self.conn.lock().unwrap() = Some(conn.clone());
        *self.handshake.lock().unwrap() = Some(handshake.clone());
        registry.register(MessageType::Ping, |payload| async move {
            Ok(Some(Reply::new(MessageType::Pong, payload)))
        })?;
        Ok(())
    }
}

#[tokio::test]
async fn test_handshake_carries_document_id() {
    let hooks = CaptureHooks::default();
    let conn_slot = hooks.conn.clone();
    let handshake_slot = hooks.handshake.clone();
    let (_server, url) = start_server(hooks).await;

    let _client = SyncClient::connect(&url, "abc").await.unwrap();

    for _ in 0..100 {
        if conn_slot.lock().unwrap().is_some() {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }

    let conn = conn_slot.lock().unwrap().clone().unwrap();
    assert_eq!(conn.doc_id(), "abc");
    assert_eq!(conn.state(), LifecycleState::Open);

    let handshake = handshake_slot.lock().unwrap().clone().unwrap();
    assert_eq!(handshake.path, "/abc");
    assert_eq!(handshake.doc_id, "abc");
}

#[tokio::test]
async fn test_handshake_without_document_id_rejected() {
    let (server, url) = start_server(CaptureHooks::default()).await;

    // Path "/" has no final segment to name a document.
    let result = tokio_tungstenite::connect_async(format!("{url}/")).await;
    assert!(result.is_err(), "upgrade must be refused without a doc id");

    for _ in 0..100 {
        if server.stats().rejected_handshakes == 1 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.stats().rejected_handshakes, 1);
}

#[tokio::test]
async fn test_post_close_send_is_silent_noop() {
    let hooks = CaptureHooks::default();
    let conn_slot = hooks.conn.clone();
    let (_server, url) = start_server(hooks).await;

    let client = SyncClient::connect(&url, "abc").await.unwrap();
    for _ in 0..100 {
        if conn_slot.lock().unwrap().is_some() {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    let conn = conn_slot.lock().unwrap().clone().unwrap();

    client.close();
    for _ in 0..100 {
        if conn.state() == LifecycleState::Closed {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(conn.state(), LifecycleState::Closed);

    // A response produced after disconnect simply disappears.
    conn.send(encode_frame(1, &[1, 2, 3]));
    conn.close();

    // And the server keeps serving new sessions.
    let mut late = SyncClient::connect(&url, "abc").await.unwrap();
    late.send(MessageType::Ping, &[8]).unwrap();
    let (tag, _) = timeout(Duration::from_secs(2), late.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tag, MessageType::Pong.tag());
}

#[tokio::test]
async fn test_graceful_shutdown_keeps_open_sessions() {
    let (server, url) = start_server(StepHooks {
        reply_payload: vec![],
    })
    .await;

    let mut client = SyncClient::connect(&url, "abc").await.unwrap();
    server.shutdown(ShutdownMode::Graceful).await;
    sleep(Duration::from_millis(50)).await;

    // No new sessions...
    assert!(SyncClient::connect(&url, "abc").await.is_err());

    // ...but the open one keeps working.
    client.send(MessageType::Ping, &[3]).unwrap();
    let (tag, _) = timeout(Duration::from_secs(2), client.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tag, MessageType::Pong.tag());
}

#[tokio::test]
async fn test_forceful_shutdown_closes_sessions() {
    let (server, url) = start_server(StepHooks {
        reply_payload: vec![],
    })
    .await;

    let mut client = SyncClient::connect(&url, "abc").await.unwrap();
    for _ in 0..100 {
        if server.connection_count().await == 1 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }

    server.shutdown(ShutdownMode::Forceful).await;

    let gone = timeout(Duration::from_secs(2), client.recv()).await.unwrap();
    assert!(gone.is_none(), "forceful shutdown must close the session");
}

#[tokio::test]
async fn test_run_binds_configured_address() {
    init_logging();
    // Find a free port: bind, read, release.
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };
    let server = Arc::new(SyncServer::new(
        config,
        StepHooks {
            reply_payload: vec![],
        },
    ));
    let running = server.clone();
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    sleep(Duration::from_millis(50)).await;

    let mut client = SyncClient::connect(format!("ws://127.0.0.1:{port}"), "abc")
        .await
        .unwrap();
    client.send(MessageType::Ping, &[1]).unwrap();
    let (tag, _) = timeout(Duration::from_secs(2), client.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tag, MessageType::Pong.tag());
}

#[tokio::test]
async fn test_stats_track_connection_lifecycle() {
    let (server, url) = start_server(StepHooks {
        reply_payload: vec![],
    })
    .await;

    let client1 = SyncClient::connect(&url, "a").await.unwrap();
    let _client2 = SyncClient::connect(&url, "b").await.unwrap();

    for _ in 0..100 {
        if server.stats().active_connections == 2 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    let stats = server.stats();
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.active_connections, 2);

    client1.close();
    for _ in 0..100 {
        if server.stats().active_connections == 1 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    let stats = server.stats();
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.active_connections, 1);
    assert_eq!(server.connection_count().await, 1);
}

/// Echoes updates back with a delay on the first frame, to show that
/// replies leave in arrival order even when latency varies.
struct EchoHooks;

impl SessionHooks for EchoHooks {
    fn on_connect(
        &self,
        _conn: &Arc<Connection>,
        _handshake: &Handshake,
        registry: &mut HandlerRegistry,
    ) -> Result<(), SessionError> {
        registry.register(MessageType::Update, |payload| async move {
            if payload[0] == 0 {
                sleep(Duration::from_millis(100)).await;
            }
            Ok(Some(Reply::new(MessageType::Update, payload)))
        })?;
        Ok(())
    }
}

#[tokio::test]
async fn test_replies_leave_in_arrival_order() {
    let (_server, url) = start_server(EchoHooks).await;

    let mut client = SyncClient::connect(&url, "abc").await.unwrap();
    for i in 0u8..3 {
        client.send(MessageType::Update, &[i]).unwrap();
    }

    for expected in 0u8..3 {
        let (tag, payload) = timeout(Duration::from_secs(2), client.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tag, MessageType::Update.tag());
        assert_eq!(payload, vec![expected]);
    }
}

#[tokio::test]
async fn test_client_state_follows_connection() {
    let (_server, url) = start_server(StepHooks {
        reply_payload: vec![],
    })
    .await;

    let mut client = SyncClient::connect(&url, "abc").await.unwrap();
    assert_eq!(client.state().await, vellum_sync::ConnectionState::Connected);

    client.close();
    let _ = timeout(Duration::from_secs(2), client.recv()).await;
    for _ in 0..100 {
        if client.state().await == vellum_sync::ConnectionState::Disconnected {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(client.state().await, vellum_sync::ConnectionState::Disconnected);
}
