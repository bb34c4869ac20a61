//! The persistent duplex connection: connect/reconnect lifecycle,
//! authenticated handshake, and inbound/outbound frame multiplexing. One
//! supervisor task owns the transport; callers interact synchronously and
//! are never handed an exception for a transport fault.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, protocol::Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{info, warn};

use fintrack_shared::{
    domain::UserId,
    protocol::{ClientFrame, InboundMessage, OnlineUser, ServerFrame},
};

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub server_url: String,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone)]
pub enum PresenceEvent {
    Typing {
        sender_id: UserId,
        sender_name: String,
        typing: bool,
    },
    Roster { users: Vec<OnlineUser> },
    UserInfo {
        user_id: UserId,
        display_name: String,
    },
    Disconnected { user_id: UserId },
}

/// The five event kinds every consumer of the channel sees. Transport
/// variability never leaks past this enum.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    Message {
        message: InboundMessage,
        broadcast: bool,
    },
    Presence(PresenceEvent),
    TransportError(String),
}

pub struct SessionChannel {
    config: ChannelConfig,
    inner: Mutex<ChannelInner>,
    events: broadcast::Sender<ChannelEvent>,
}

struct ChannelInner {
    state: ChannelState,
    outbound: Option<mpsc::UnboundedSender<ClientFrame>>,
    supervisor: Option<JoinHandle<()>>,
}

impl SessionChannel {
    pub fn new(config: ChannelConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            config,
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Idle,
                outbound: None,
                supervisor: None,
            }),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ChannelState {
        self.lock_inner().state
    }

    /// Idempotent: a no-op while a supervisor is alive. Never blocks on the
    /// handshake and never errors; completion surfaces as `Connected` or
    /// `Disconnected` events.
    pub fn open(self: &Arc<Self>, auth_token: &str) {
        let mut inner = self.lock_inner();
        let supervisor_alive = inner
            .supervisor
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        if supervisor_alive {
            return;
        }
        inner.state = ChannelState::Connecting;
        let channel = Arc::clone(self);
        let token = auth_token.to_string();
        inner.supervisor = Some(tokio::spawn(async move { channel.run(token).await }));
    }

    /// `false` immediately when the channel is not connected; no network
    /// attempt is made. `true` means the frame is queued; delivery is only
    /// confirmed by a later echo.
    pub fn send_message(&self, recipient_id: &UserId, body: String, encrypted: bool) -> bool {
        self.send_frame(ClientFrame::SendMessage {
            recipient_id: recipient_id.clone(),
            body,
            encrypted,
        })
    }

    /// Fire-and-forget; dropped silently while disconnected.
    pub fn notify_typing(&self, recipient_id: &UserId, typing: bool) {
        let _ = self.send_frame(ClientFrame::Typing {
            recipient_id: recipient_id.clone(),
            typing,
        });
    }

    pub fn request_online_users(&self) -> bool {
        self.send_frame(ClientFrame::GetOnlineUsers)
    }

    pub fn request_user_info(&self, user_id: &UserId) -> bool {
        self.send_frame(ClientFrame::GetUserInfo {
            user_id: user_id.clone(),
        })
    }

    /// Releases the transport. Subsequent sends fail synchronously until a
    /// fresh `open`.
    pub fn close(&self) {
        let supervisor = {
            let mut inner = self.lock_inner();
            inner.state = ChannelState::Closed;
            inner.outbound = None;
            inner.supervisor.take()
        };
        if let Some(task) = supervisor {
            task.abort();
        }
        let _ = self.events.send(ChannelEvent::Disconnected);
    }

    fn send_frame(&self, frame: ClientFrame) -> bool {
        let inner = self.lock_inner();
        if inner.state != ChannelState::Connected {
            return false;
        }
        match &inner.outbound {
            Some(outbound) => outbound.send(frame).is_ok(),
            None => false,
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, ChannelInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn run(self: Arc<Self>, token: String) {
        let mut backoff = self.config.reconnect_initial;
        loop {
            {
                let mut inner = self.lock_inner();
                if inner.state == ChannelState::Closed {
                    return;
                }
                inner.state = ChannelState::Connecting;
            }

            let url = match websocket_url(&self.config.server_url, &token) {
                Ok(url) => url,
                Err(error) => {
                    // A misconfigured server url cannot self-heal by retrying.
                    self.settle_disconnected(Some(error.to_string()));
                    return;
                }
            };

            match connect_async(url.as_str()).await {
                Ok((stream, _response)) => {
                    backoff = self.config.reconnect_initial;
                    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                    {
                        let mut inner = self.lock_inner();
                        if inner.state == ChannelState::Closed {
                            return;
                        }
                        inner.state = ChannelState::Connected;
                        inner.outbound = Some(outbound_tx);
                    }
                    info!("session channel connected");
                    let _ = self.events.send(ChannelEvent::Connected);

                    let fault = self.pump(stream, outbound_rx).await;

                    {
                        let mut inner = self.lock_inner();
                        inner.outbound = None;
                        if inner.state == ChannelState::Closed {
                            return;
                        }
                        inner.state = ChannelState::Disconnected;
                    }
                    if let Some(error) = fault {
                        warn!(%error, "transport fault, reconnecting");
                        let _ = self.events.send(ChannelEvent::TransportError(error));
                    }
                    let _ = self.events.send(ChannelEvent::Disconnected);
                }
                Err(error) => {
                    if handshake_rejected(&error) {
                        // Auth rejection is terminal for this session; a new
                        // open() with a fresh token starts over. No retry storm.
                        warn!(%error, "handshake rejected");
                        self.settle_disconnected(Some(format!("handshake rejected: {error}")));
                        return;
                    }
                    warn!(%error, "connect failed, retrying");
                    let _ = self.events.send(ChannelEvent::TransportError(error.to_string()));
                    {
                        let mut inner = self.lock_inner();
                        if inner.state == ChannelState::Closed {
                            return;
                        }
                        inner.state = ChannelState::Disconnected;
                    }
                    let _ = self.events.send(ChannelEvent::Disconnected);
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.reconnect_max);
        }
    }

    /// Drives one live socket until it dies or the channel closes. Returns
    /// the fault description for abnormal endings.
    async fn pump(
        &self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        mut outbound_rx: mpsc::UnboundedReceiver<ClientFrame>,
    ) -> Option<String> {
        let (mut sink, mut source) = stream.split();
        loop {
            tokio::select! {
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => {
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(error) => {
                                warn!(%error, "dropping unserializable outbound frame");
                                continue;
                            }
                        };
                        if let Err(error) = sink.send(WsMessage::Text(text)).await {
                            return Some(error.to_string());
                        }
                    }
                    None => return None,
                },
                message = source.next() => match message {
                    Some(Ok(WsMessage::Text(text))) => self.dispatch(&text),
                    Some(Ok(WsMessage::Close(_))) | None => return None,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => return Some(error.to_string()),
                },
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let frame = match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "dropping malformed inbound frame");
                return;
            }
        };

        let event = match frame {
            ServerFrame::ReceiveMessage(message) | ServerFrame::AdminMessage(message) => {
                ChannelEvent::Message {
                    message,
                    broadcast: false,
                }
            }
            ServerFrame::AdminBroadcast(message) => ChannelEvent::Message {
                message,
                broadcast: true,
            },
            ServerFrame::UserTyping {
                sender_id,
                sender_name,
                typing,
            } => ChannelEvent::Presence(PresenceEvent::Typing {
                sender_id,
                sender_name,
                typing,
            }),
            ServerFrame::OnlineUsers { users } => {
                ChannelEvent::Presence(PresenceEvent::Roster { users })
            }
            ServerFrame::UserInfo {
                user_id,
                display_name,
            } => ChannelEvent::Presence(PresenceEvent::UserInfo {
                user_id,
                display_name,
            }),
            ServerFrame::UserDisconnected { user_id } => {
                ChannelEvent::Presence(PresenceEvent::Disconnected { user_id })
            }
            ServerFrame::Error(error) => ChannelEvent::TransportError(error.to_string()),
        };
        let _ = self.events.send(event);
    }

    fn settle_disconnected(&self, fault: Option<String>) {
        {
            let mut inner = self.lock_inner();
            if inner.state == ChannelState::Closed {
                return;
            }
            inner.state = ChannelState::Disconnected;
        }
        if let Some(error) = fault {
            let _ = self.events.send(ChannelEvent::TransportError(error));
        }
        let _ = self.events.send(ChannelEvent::Disconnected);
    }
}

fn handshake_rejected(error: &tungstenite::Error) -> bool {
    match error {
        tungstenite::Error::Http(response) => response.status().is_client_error(),
        _ => false,
    }
}

fn websocket_url(server_url: &str, token: &str) -> anyhow::Result<String> {
    let base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if server_url.starts_with("ws://") || server_url.starts_with("wss://") {
        server_url.to_string()
    } else {
        anyhow::bail!("server_url must start with http://, https://, ws:// or wss://");
    };
    let base = base.trim_end_matches('/');
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("token", token)
        .finish();
    Ok(format!("{base}/ws?{query}"))
}

#[cfg(test)]
mod url_tests {
    use super::websocket_url;

    #[test]
    fn maps_http_schemes_to_websocket_schemes() {
        assert_eq!(
            websocket_url("http://127.0.0.1:9000", "t").expect("url"),
            "ws://127.0.0.1:9000/ws?token=t"
        );
        assert!(websocket_url("https://chat.example.test/", "t")
            .expect("url")
            .starts_with("wss://chat.example.test/ws?"));
    }

    #[test]
    fn token_is_query_encoded() {
        let url = websocket_url("ws://h", "a.b/c=").expect("url");
        assert!(!url.contains("a.b/c="));
        assert!(url.contains("token=a.b%2Fc%3D"));
    }

    #[test]
    fn rejects_unknown_schemes() {
        assert!(websocket_url("ftp://h", "t").is_err());
    }
}
