use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use tokio::{net::TcpListener, sync::broadcast, time::timeout};

use fintrack_shared::{
    domain::{MessageId, UserId},
    protocol::{ClientFrame, InboundMessage, ServerFrame},
};

use crate::channel::{ChannelConfig, ChannelEvent, ChannelState, SessionChannel};
use crate::identity::make_token;

#[derive(Clone)]
struct WsServerState {
    /// Upgrade attempts, including rejected ones.
    attempts: Arc<AtomicUsize>,
    /// Sockets actually accepted.
    connections: Arc<AtomicUsize>,
    typing_frames: Arc<StdMutex<Vec<(UserId, bool)>>>,
    wire_bodies: Arc<StdMutex<Vec<String>>>,
    next_id: Arc<AtomicU64>,
    drop_next_socket: Arc<AtomicBool>,
}

impl WsServerState {
    fn new() -> Self {
        Self {
            attempts: Arc::new(AtomicUsize::new(0)),
            connections: Arc::new(AtomicUsize::new(0)),
            typing_frames: Arc::new(StdMutex::new(Vec::new())),
            wire_bodies: Arc::new(StdMutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            drop_next_socket: Arc::new(AtomicBool::new(false)),
        }
    }
}

async fn ws_handler(
    State(state): State<WsServerState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    state.attempts.fetch_add(1, Ordering::SeqCst);
    let token = params.get("token").cloned().unwrap_or_default();
    if token == "reject-me" {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| serve_socket(socket, state))
        .into_response()
}

async fn serve_socket(mut socket: WebSocket, state: WsServerState) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    if state.drop_next_socket.swap(false, Ordering::SeqCst) {
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        let AxumWsMessage::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
            continue;
        };
        match frame {
            ClientFrame::SendMessage {
                recipient_id,
                body,
                encrypted,
            } => {
                state.wire_bodies.lock().expect("lock").push(body.clone());
                let id = state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                let echo = ServerFrame::ReceiveMessage(InboundMessage {
                    id: Some(MessageId::new(format!("srv-{id}"))),
                    sender_id: UserId::new("u1"),
                    sender_name: None,
                    recipient_id,
                    body,
                    encrypted,
                    sent_at: Utc::now(),
                });
                let text = serde_json::to_string(&echo).expect("serialize");
                if socket.send(AxumWsMessage::Text(text)).await.is_err() {
                    return;
                }
            }
            ClientFrame::Typing {
                recipient_id,
                typing,
            } => {
                state
                    .typing_frames
                    .lock()
                    .expect("lock")
                    .push((recipient_id, typing));
            }
            ClientFrame::GetOnlineUsers | ClientFrame::GetUserInfo { .. } => {}
        }
    }
}

async fn spawn_ws_server() -> (String, WsServerState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = WsServerState::new();
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

fn fast_config(server_url: String) -> ChannelConfig {
    ChannelConfig {
        server_url,
        reconnect_initial: Duration::from_millis(50),
        reconnect_max: Duration::from_millis(200),
    }
}

async fn next_matching(
    rx: &mut broadcast::Receiver<ChannelEvent>,
    predicate: impl Fn(&ChannelEvent) -> bool,
) -> ChannelEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event stream open");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event within deadline")
}

#[tokio::test]
async fn send_fails_synchronously_while_offline() {
    let channel = SessionChannel::new(fast_config("http://127.0.0.1:1".into()));
    assert_eq!(channel.state(), ChannelState::Idle);
    assert!(!channel.send_message(&UserId::new("support"), "hello".into(), false));
}

#[tokio::test]
async fn connects_and_echoes_a_sent_message() {
    let (server_url, _state) = spawn_ws_server().await;
    let channel = SessionChannel::new(fast_config(server_url));
    let mut rx = channel.subscribe();
    channel.open(&make_token("u1", "Ada", None));

    next_matching(&mut rx, |e| matches!(e, ChannelEvent::Connected)).await;
    assert!(channel.send_message(&UserId::new("support"), "hello".into(), false));

    let event = next_matching(&mut rx, |e| matches!(e, ChannelEvent::Message { .. })).await;
    let ChannelEvent::Message { message, broadcast } = event else {
        unreachable!();
    };
    assert_eq!(message.id, Some(MessageId::new("srv-1")));
    assert_eq!(message.body, "hello");
    assert!(!broadcast);
}

#[tokio::test]
async fn open_is_idempotent_while_connected() {
    let (server_url, state) = spawn_ws_server().await;
    let channel = SessionChannel::new(fast_config(server_url));
    let mut rx = channel.subscribe();
    let token = make_token("u1", "Ada", None);
    channel.open(&token);
    next_matching(&mut rx, |e| matches!(e, ChannelEvent::Connected)).await;

    channel.open(&token);
    channel.open(&token);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(state.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn handshake_rejection_settles_without_a_retry_storm() {
    let (server_url, state) = spawn_ws_server().await;
    let channel = SessionChannel::new(fast_config(server_url));
    let mut rx = channel.subscribe();
    channel.open("reject-me");

    next_matching(&mut rx, |e| matches!(e, ChannelEvent::Disconnected)).await;
    // Several backoff periods worth of quiet: no further attempts.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(state.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(channel.state(), ChannelState::Disconnected);
    assert!(!channel.send_message(&UserId::new("support"), "hello".into(), false));
}

#[tokio::test]
async fn reconnects_after_the_server_drops_the_socket() {
    let (server_url, state) = spawn_ws_server().await;
    state.drop_next_socket.store(true, Ordering::SeqCst);

    let channel = SessionChannel::new(fast_config(server_url));
    let mut rx = channel.subscribe();
    channel.open(&make_token("u1", "Ada", None));

    // First Connected is the socket the server immediately drops.
    next_matching(&mut rx, |e| matches!(e, ChannelEvent::Connected)).await;
    next_matching(&mut rx, |e| matches!(e, ChannelEvent::Disconnected)).await;
    next_matching(&mut rx, |e| matches!(e, ChannelEvent::Connected)).await;

    assert!(state.connections.load(Ordering::SeqCst) >= 2);
    assert_eq!(channel.state(), ChannelState::Connected);
}

#[tokio::test]
async fn close_is_terminal_until_reopened() {
    let (server_url, state) = spawn_ws_server().await;
    let channel = SessionChannel::new(fast_config(server_url));
    let mut rx = channel.subscribe();
    let token = make_token("u1", "Ada", None);
    channel.open(&token);
    next_matching(&mut rx, |e| matches!(e, ChannelEvent::Connected)).await;

    channel.close();
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(!channel.send_message(&UserId::new("support"), "hello".into(), false));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(state.connections.load(Ordering::SeqCst), 1);

    channel.open(&token);
    next_matching(&mut rx, |e| matches!(e, ChannelEvent::Connected)).await;
    assert!(channel.send_message(&UserId::new("support"), "hello".into(), false));
}

#[tokio::test]
async fn typing_frames_reach_the_server() {
    let (server_url, state) = spawn_ws_server().await;
    let channel = SessionChannel::new(fast_config(server_url));
    let mut rx = channel.subscribe();
    channel.open(&make_token("u1", "Ada", None));
    next_matching(&mut rx, |e| matches!(e, ChannelEvent::Connected)).await;

    channel.notify_typing(&UserId::new("support"), true);
    channel.notify_typing(&UserId::new("support"), false);

    timeout(Duration::from_secs(5), async {
        loop {
            if state.typing_frames.lock().expect("lock").len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("typing frames within deadline");

    let frames = state.typing_frames.lock().expect("lock").clone();
    assert_eq!(
        frames,
        vec![
            (UserId::new("support"), true),
            (UserId::new("support"), false)
        ]
    );
}
