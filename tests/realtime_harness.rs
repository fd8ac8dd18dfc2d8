//! Realtime channel integration tests against an in-process mock server.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::StreamExt;
use hostdb_sdk::bus::EventBus;
use hostdb_sdk::realtime::channel::{ChannelLog, ChannelState, RealtimeChannel, RealtimeConfig};
use hostdb_sdk::realtime::proto::KEY_UPDATE_EVENT;
use hostdb_sdk::session::SessionState;
use hostdb_sdk::storage::StorageClient;
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

const TEST_API_KEY: &str = "test-api-key";

#[derive(Clone)]
struct WsScript {
    frames: Vec<String>,
    close_after_frames: bool,
    first_frame_tx: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

impl WsScript {
    fn new(frames: &[&str], close_after_frames: bool) -> (Self, oneshot::Receiver<String>) {
        let (first_frame_tx, first_frame_rx) = oneshot::channel();
        (
            Self {
                frames: frames.iter().map(|frame| frame.to_string()).collect(),
                close_after_frames,
                first_frame_tx: Arc::new(Mutex::new(Some(first_frame_tx))),
            },
            first_frame_rx,
        )
    }
}

async fn ws_handler(State(script): State<WsScript>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_script(socket, script))
}

async fn run_script(mut socket: WebSocket, script: WsScript) {
    // The first inbound frame must be the credential message.
    let first = loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => break text.to_string(),
            Some(Ok(_)) => continue,
            _ => return,
        }
    };
    if let Some(tx) = script.first_frame_tx.lock().unwrap().take() {
        let _ = tx.send(first);
    }

    for frame in &script.frames {
        if socket
            .send(Message::Text(frame.clone().into()))
            .await
            .is_err()
        {
            return;
        }
    }

    if script.close_after_frames {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    // Answer keep-alive probes and hold the socket open until the client
    // goes away.
    while let Some(Ok(message)) = socket.next().await {
        if let Message::Text(text) = message {
            if text.as_str() == "PING"
                && socket.send(Message::Text("PONG".into())).await.is_err()
            {
                return;
            }
        }
    }
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}

async fn spawn_ws_server(
    frames: &[&str],
) -> (
    SocketAddr,
    oneshot::Receiver<String>,
    oneshot::Sender<()>,
    tokio::task::JoinHandle<()>,
) {
    spawn_ws_server_with(frames, false).await
}

async fn spawn_ws_server_with(
    frames: &[&str],
    close_after_frames: bool,
) -> (
    SocketAddr,
    oneshot::Receiver<String>,
    oneshot::Sender<()>,
    tokio::task::JoinHandle<()>,
) {
    let (script, first_frame_rx) = WsScript::new(frames, close_after_frames);
    let app = Router::new()
        .route("/subscribe/demoDb", get(ws_handler))
        .with_state(script);
    let (addr, shutdown_tx, task) = spawn_server(app).await;
    (addr, first_frame_rx, shutdown_tx, task)
}

fn channel_for(addr: SocketAddr, session: SessionState, bus: EventBus) -> RealtimeChannel {
    RealtimeChannel::new(
        RealtimeConfig::new(
            format!("ws://{addr}/subscribe/demoDb"),
            SecretString::new(TEST_API_KEY.to_string()),
        ),
        session,
        bus,
    )
}

async fn next_line(log: &mut ChannelLog) -> String {
    timeout(Duration::from_secs(2), log.recv())
        .await
        .expect("timed out waiting for log line")
        .expect("log stream ended unexpectedly")
}

async fn wait_for_state(channel: &RealtimeChannel, wanted: ChannelState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while channel.state() != wanted {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for channel state {wanted:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn credential_frame_precedes_all_other_traffic() {
    let (addr, first_frame_rx, shutdown_tx, server) = spawn_ws_server(&[]).await;
    let mut channel = channel_for(addr, SessionState::new(), EventBus::new());

    let _log = channel.connect().await.expect("connect channel");
    assert_eq!(channel.state(), ChannelState::Open);

    let first = timeout(Duration::from_secs(2), first_frame_rx)
        .await
        .expect("timed out waiting for first frame")
        .expect("ws server dropped before first frame");
    assert_eq!(
        serde_json::from_str::<Value>(&first).expect("credential json"),
        json!({"API_KEY": TEST_API_KEY})
    );

    channel.disconnect().await.expect("disconnect");
    let _ = shutdown_tx.send(());
    server.await.expect("mock ws server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_announcement_updates_shared_state() {
    let (addr, _first_frame_rx, shutdown_tx, server) =
        spawn_ws_server(&[r#"{"event":"NEW","sessionId":"abc"}"#]).await;
    let session = SessionState::new();
    let mut channel = channel_for(addr, session.clone(), EventBus::new());

    let mut log = channel.connect().await.expect("connect channel");
    assert_eq!(next_line(&mut log).await, "--- socket opened");
    assert_eq!(next_line(&mut log).await, "--- session opened: abc");
    assert_eq!(session.get().as_deref(), Some("abc"));

    channel.disconnect().await.expect("disconnect");
    let _ = shutdown_tx.send(());
    server.await.expect("mock ws server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn change_notification_triggers_refetch_with_session_affinity() {
    // REST mock: records the SESSION_ID header and serves the changed record.
    #[derive(Clone, Default)]
    struct HttpObserved {
        session_ids: Arc<Mutex<Vec<Option<String>>>>,
    }
    let observed = HttpObserved::default();
    let rest_app = Router::new()
        .route(
            "/storage/{key}",
            get(
                |State(observed): State<HttpObserved>, headers: HeaderMap| async move {
                    observed.session_ids.lock().unwrap().push(
                        headers
                            .get("SESSION_ID")
                            .and_then(|value| value.to_str().ok())
                            .map(str::to_string),
                    );
                    (StatusCode::OK, Json(json!(["Mike G.", "Stephan R."])))
                },
            ),
        )
        .with_state(observed.clone());
    let (rest_addr, rest_shutdown_tx, rest_server) = spawn_server(rest_app).await;

    let (ws_addr, _first_frame_rx, ws_shutdown_tx, ws_server) = spawn_ws_server(&[
        r#"{"event":"NEW","sessionId":"abc"}"#,
        r#"{"event":"UPDATE","key":"demo-key-7"}"#,
    ])
    .await;

    let session = SessionState::new();
    let bus = EventBus::new();
    let storage = StorageClient::new(
        format!("http://{rest_addr}/storage"),
        SecretString::new(TEST_API_KEY.to_string()),
        session.clone(),
    )
    .expect("build storage client");

    // Consumers refetch the affected key when an invalidation arrives.
    let (invalidated_tx, mut invalidated_rx) = mpsc::unbounded_channel();
    let _sub = bus.on(KEY_UPDATE_EVENT, move |payload| {
        if let Value::String(key) = payload {
            let _ = invalidated_tx.send(key.clone());
        }
    });

    let mut channel = channel_for(ws_addr, session.clone(), bus);
    let _log = channel.connect().await.expect("connect channel");

    let key = timeout(Duration::from_secs(2), invalidated_rx.recv())
        .await
        .expect("timed out waiting for invalidation")
        .expect("invalidation channel closed");
    assert_eq!(key, "demo-key-7");

    let refreshed = storage.get(&key).await.expect("refetch changed key");
    assert_eq!(refreshed, Some(json!(["Mike G.", "Stephan R."])));
    assert_eq!(
        observed.session_ids.lock().unwrap().as_slice(),
        [Some("abc".to_string())]
    );

    channel.disconnect().await.expect("disconnect");
    let _ = ws_shutdown_tx.send(());
    let _ = rest_shutdown_tx.send(());
    ws_server.await.expect("mock ws server task should join");
    rest_server.await.expect("mock rest server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_json_text_is_logged_not_broadcast() {
    let (addr, _first_frame_rx, shutdown_tx, server) = spawn_ws_server(&["hello"]).await;
    let bus = EventBus::new();
    let broadcasts = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&broadcasts);
    let _sub = bus.on(KEY_UPDATE_EVENT, move |_| {
        *sink.lock().unwrap() += 1;
    });

    let mut channel = channel_for(addr, SessionState::new(), bus);
    let mut log = channel.connect().await.expect("connect channel");

    assert_eq!(next_line(&mut log).await, "--- socket opened");
    assert_eq!(next_line(&mut log).await, "hello");
    assert_eq!(*broadcasts.lock().unwrap(), 0);

    channel.disconnect().await.expect("disconnect");
    let _ = shutdown_tx.send(());
    server.await.expect("mock ws server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_is_answered_with_opaque_pong() {
    let (addr, _first_frame_rx, shutdown_tx, server) = spawn_ws_server(&[]).await;
    let mut channel = channel_for(addr, SessionState::new(), EventBus::new());

    let mut log = channel.connect().await.expect("connect channel");
    assert_eq!(next_line(&mut log).await, "--- socket opened");

    channel.ping().expect("queue ping");
    assert_eq!(next_line(&mut log).await, "PONG");

    channel.disconnect().await.expect("disconnect");
    let _ = shutdown_tx.send(());
    server.await.expect("mock ws server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_while_open_is_rejected() {
    let (addr, _first_frame_rx, shutdown_tx, server) = spawn_ws_server(&[]).await;
    let mut channel = channel_for(addr, SessionState::new(), EventBus::new());

    let _log = channel.connect().await.expect("first connect");
    assert_eq!(channel.state(), ChannelState::Open);
    assert!(channel.connect().await.is_err());
    assert_eq!(channel.state(), ChannelState::Open);

    channel.disconnect().await.expect("disconnect");
    let _ = shutdown_tx.send(());
    server.await.expect("mock ws server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_is_idempotent_and_channel_is_reusable() {
    let (addr, _first_frame_rx, shutdown_tx, server) = spawn_ws_server(&[]).await;
    let mut channel = channel_for(addr, SessionState::new(), EventBus::new());

    let _log = channel.connect().await.expect("first connect");
    channel.disconnect().await.expect("first disconnect");
    assert_eq!(channel.state(), ChannelState::Disconnected);
    channel.disconnect().await.expect("second disconnect");

    // Reconnecting creates a fresh transport.
    let mut log = channel.connect().await.expect("reconnect");
    assert_eq!(next_line(&mut log).await, "--- socket opened");
    assert_eq!(channel.state(), ChannelState::Open);

    channel.disconnect().await.expect("final disconnect");
    let _ = shutdown_tx.send(());
    server.await.expect("mock ws server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_close_ends_in_disconnected_without_clearing_session() {
    // The mock closes the socket itself after announcing the session end.
    let (addr, _first_frame_rx, shutdown_tx, server) = spawn_ws_server_with(
        &[
            r#"{"event":"NEW","sessionId":"abc"}"#,
            r#"{"event":"CLOSED","sessionId":"abc"}"#,
        ],
        true,
    )
    .await;
    let session = SessionState::new();
    let mut channel = channel_for(addr, session.clone(), EventBus::new());

    let mut log = channel.connect().await.expect("connect channel");
    assert_eq!(next_line(&mut log).await, "--- socket opened");
    assert_eq!(next_line(&mut log).await, "--- session opened: abc");
    assert_eq!(next_line(&mut log).await, "--- session closed: abc");
    assert_eq!(next_line(&mut log).await, "--- socket closed");

    wait_for_state(&channel, ChannelState::Disconnected).await;
    // The adopted identity survives the socket; callers clear it explicitly.
    assert_eq!(session.get().as_deref(), Some("abc"));

    channel.disconnect().await.expect("disconnect after close");
    let _ = shutdown_tx.send(());
    server.await.expect("mock ws server task should join");
}
