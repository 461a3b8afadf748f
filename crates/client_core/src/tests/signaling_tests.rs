use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use shared::protocol::SignalKind;
use tokio::{net::TcpListener, time::timeout};

use super::*;

#[derive(Clone)]
struct ServerState {
    connections: Arc<AtomicUsize>,
    /// Frames received from the client under test.
    received: mpsc::Sender<(String, String)>,
    /// Close the socket right after greeting, to exercise reconnect.
    drop_after_greeting: bool,
}

async fn ws_handler(
    Path(identity): Path<String>,
    State(state): State<ServerState>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| serve_socket(socket, identity, state))
}

async fn serve_socket(mut socket: WebSocket, identity: String, state: ServerState) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    let greeting = Frame::signal("server", SignalKind::AudioChunk, "aGVsbG8=").encode();
    if socket.send(WsMessage::Text(greeting)).await.is_err() {
        return;
    }
    if state.drop_after_greeting {
        return; // dropping the socket closes it server-side
    }
    while let Some(Ok(message)) = socket.recv().await {
        if let WsMessage::Text(text) = message {
            if state.received.send((identity.clone(), text)).await.is_err() {
                return;
            }
        }
    }
}

async fn spawn_server(
    drop_after_greeting: bool,
) -> (String, Arc<AtomicUsize>, mpsc::Receiver<(String, String)>) {
    let connections = Arc::new(AtomicUsize::new(0));
    let (received_tx, received_rx) = mpsc::channel(16);
    let state = ServerState {
        connections: Arc::clone(&connections),
        received: received_tx,
        drop_after_greeting,
    };
    let app = Router::new()
        .route("/:identity", get(ws_handler))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("ws://{addr}"), connections, received_rx)
}

async fn next_event(events: &mut mpsc::Receiver<SignalingEvent>) -> SignalingEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for signaling event")
        .expect("event stream closed")
}

#[tokio::test]
async fn frames_flow_both_ways_over_the_identity_channel() {
    let (url, _connections, mut received) = spawn_server(false).await;
    let (events_tx, mut events) = mpsc::channel(32);
    let transport = SignalingTransport::new(url, events_tx);

    transport
        .connect(UserId::new("alice"))
        .await
        .expect("connect");

    match next_event(&mut events).await {
        SignalingEvent::Connected { identity } => assert_eq!(identity.as_str(), "alice"),
        other => panic!("unexpected event: {other:?}"),
    }
    match next_event(&mut events).await {
        SignalingEvent::Frame(Frame::Signal { peer, kind, payload }) => {
            assert_eq!(peer.as_str(), "server");
            assert_eq!(kind, SignalKind::AudioChunk);
            assert_eq!(payload, "aGVsbG8=");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    assert!(
        transport
            .send(&Frame::signal("bob", SignalKind::CallEnd, ""))
            .await
    );
    let (identity, raw) = timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("timed out waiting for server receive")
        .expect("server closed");
    assert_eq!(identity, "alice");
    assert_eq!(raw, "SIGNAL|bob|CALL_END|");
}

#[tokio::test]
async fn stream_control_frames_bracket_a_raw_audio_stream() {
    let (url, _connections, mut received) = spawn_server(false).await;
    let (events_tx, _events) = mpsc::channel(32);
    let transport = SignalingTransport::new(url, events_tx);
    transport
        .connect(UserId::new("alice"))
        .await
        .expect("connect");

    use shared::protocol::StreamFormat;
    assert!(
        transport
            .send(&Frame::StartStream {
                target: UserId::new("bob"),
                format: StreamFormat::Pcm,
            })
            .await
    );
    assert!(transport.send_chunk(vec![1, 2, 3]).await);
    assert!(transport.send(&Frame::StopStream).await);

    let (_, raw) = timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("receive")
        .expect("open");
    assert_eq!(raw, "START_STREAM|bob|format=pcm");
    let (_, raw) = timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("receive")
        .expect("open");
    assert_eq!(raw, "STOP_STREAM");
}

#[tokio::test]
async fn send_reports_unavailable_while_disconnected() {
    let (events_tx, _events) = mpsc::channel(8);
    let transport = SignalingTransport::new("ws://127.0.0.1:9", events_tx);
    assert!(
        !transport
            .send(&Frame::signal("bob", SignalKind::CallEnd, ""))
            .await
    );
}

#[tokio::test]
async fn an_unexpected_closure_reconnects_after_the_fixed_delay() {
    let (url, connections, _received) = spawn_server(true).await;
    let (events_tx, mut events) = mpsc::channel(32);
    let transport = SignalingTransport::new(url, events_tx);

    transport
        .connect(UserId::new("alice"))
        .await
        .expect("connect");

    // First connection: greeting arrives, then the server drops the socket
    // and the transport schedules its single 1-second retry.
    let mut saw_close = false;
    let mut reconnected = false;
    for _ in 0..8 {
        match next_event(&mut events).await {
            SignalingEvent::Closed { will_retry } => {
                assert!(will_retry);
                saw_close = true;
            }
            SignalingEvent::Connected { .. } if saw_close => {
                reconnected = true;
                break;
            }
            _ => {}
        }
    }
    assert!(reconnected, "transport should reconnect with the original identity");
    assert!(connections.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn explicit_connect_supersedes_the_old_channel() {
    let (url, connections, _received) = spawn_server(false).await;
    let (events_tx, mut events) = mpsc::channel(32);
    let transport = SignalingTransport::new(url, events_tx);

    transport
        .connect(UserId::new("alice"))
        .await
        .expect("first connect");
    transport
        .connect(UserId::new("alice"))
        .await
        .expect("second connect");

    // Wait until both connections have been seen, then make sure the
    // channel is still usable and nothing scheduled a retry storm.
    let mut connected = 0;
    while connected < 2 {
        if let SignalingEvent::Connected { .. } = next_event(&mut events).await {
            connected += 1;
        }
    }
    assert!(transport.is_open().await);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn shutdown_stops_the_retry_loop() {
    let (url, connections, _received) = spawn_server(true).await;
    let (events_tx, _events) = mpsc::channel(32);
    let transport = SignalingTransport::new(url, events_tx);

    transport
        .connect(UserId::new("alice"))
        .await
        .expect("connect");
    transport.shutdown().await;

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(
        connections.load(Ordering::SeqCst),
        1,
        "no reconnect may fire after an explicit shutdown"
    );
}
