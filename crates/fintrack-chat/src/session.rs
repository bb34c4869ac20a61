//! The session facade: one authenticated principal, one channel, one
//! reconciled history. Everything the UI needs goes through `ChatSession`;
//! the channel, codec, cache and presence tracker are wired here and never
//! exposed individually.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::{
    sync::{broadcast, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use fintrack_cache::MessageCache;
use fintrack_codec::BodyCodec;
use fintrack_shared::domain::{Message, PresenceEntry, Principal, UserId};

use crate::{
    channel::{ChannelEvent, SessionChannel},
    config::ChatSettings,
    identity::IdentityResolver,
    presence::{PresenceTracker, TypingNotifier},
    reconcile::{InboundRecord, Reconciler},
    unread::unread_count,
    NotificationSink,
};

/// Session-level events for the UI layer. Coarser than channel events:
/// consumers re-read `history()`/`roster()` on change rather than patching
/// their own copy.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    HistoryChanged,
    TypingChanged { user_id: UserId, typing: bool },
    RosterChanged,
    TransportError(String),
}

pub struct ChatSession {
    principal: Principal,
    token: String,
    channel: Arc<SessionChannel>,
    codec: BodyCodec,
    cache: MessageCache,
    presence: PresenceTracker,
    notifier: TypingNotifier,
    sink: Arc<dyn NotificationSink>,
    inner: AsyncMutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    event_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

struct SessionState {
    reconciler: Reconciler,
    watermark: Option<DateTime<Utc>>,
}

impl ChatSession {
    /// Resolves the principal, restores cached state and starts connecting.
    /// Returns as soon as the session is usable; the connection itself
    /// completes in the background and surfaces as a `Connected` event.
    pub async fn connect(
        settings: &ChatSettings,
        resolver: &dyn IdentityResolver,
        token: &str,
        sink: Arc<dyn NotificationSink>,
    ) -> anyhow::Result<Arc<Self>> {
        let principal = resolver.resolve(token)?;
        let codec = BodyCodec::from_base64(&settings.shared_key_b64)?;
        let cache = MessageCache::open(&settings.cache_url).await?;

        let history = cache.load_history(&principal.id).await?;
        let watermark = cache.load_watermark(&principal.id).await?;
        let reconciler = Reconciler::resume(principal.id.clone(), history);

        let channel = SessionChannel::new(settings.channel_config());
        let (events, _) = broadcast::channel(256);
        let presence = PresenceTracker::new(
            settings.typing_quiet(),
            principal.is_privileged,
            events.clone(),
        );
        let notifier = TypingNotifier::new(Arc::clone(&channel), settings.typing_quiet());

        info!(principal_id = %principal.id, "chat session starting");
        let session = Arc::new(Self {
            principal,
            token: token.to_string(),
            channel,
            codec,
            cache,
            presence,
            notifier,
            sink,
            inner: AsyncMutex::new(SessionState {
                reconciler,
                watermark,
            }),
            events,
            event_task: std::sync::Mutex::new(None),
        });

        // Subscribe before opening so the Connected event is never missed.
        session.ensure_event_loop();
        session.channel.open(&session.token);
        Ok(session)
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Re-opens the channel after a `close()` or a terminal auth rejection.
    pub fn open(self: &Arc<Self>) {
        self.ensure_event_loop();
        self.channel.open(&self.token);
    }

    pub fn close(&self) {
        self.channel.close();
        self.presence.clear();
        let task = match self.event_task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Synchronous admission: `false` means the channel was down and nothing
    /// changed, locally or remotely. On `true` an optimistic entry is in the
    /// history awaiting its echo.
    pub async fn send(&self, recipient_id: &UserId, body: String, encrypt: bool) -> bool {
        let wire_body = if encrypt {
            self.codec.encrypt(&body)
        } else {
            body.clone()
        };
        if !self.channel.send_message(recipient_id, wire_body, encrypt) {
            return false;
        }
        self.notifier.stop(recipient_id);

        {
            let mut state = self.inner.lock().await;
            state
                .reconciler
                .record_local(&self.principal, recipient_id.clone(), body, encrypt);
            self.write_through(&state).await;
        }
        let _ = self.events.send(SessionEvent::HistoryChanged);
        true
    }

    pub async fn history(&self) -> Vec<Message> {
        self.inner.lock().await.reconciler.history().to_vec()
    }

    pub async fn unread(&self) -> usize {
        let state = self.inner.lock().await;
        unread_count(
            state.reconciler.history(),
            state.watermark,
            &self.principal.id,
        )
    }

    /// Moves the watermark to now and clears the unread badge.
    pub async fn mark_read(&self) {
        let now = Utc::now();
        {
            let mut state = self.inner.lock().await;
            state.watermark = Some(now);
        }
        if let Err(error) = self.cache.save_watermark(&self.principal.id, now).await {
            warn!(%error, "failed to persist read watermark");
        }
        self.sink.publish(0).await;
    }

    pub async fn clear_history(&self) {
        {
            let mut state = self.inner.lock().await;
            state.reconciler.reset();
            state.watermark = None;
        }
        if let Err(error) = self.cache.clear(&self.principal.id).await {
            warn!(%error, "failed to clear cached history");
        }
        let _ = self.events.send(SessionEvent::HistoryChanged);
    }

    pub fn roster(&self) -> Vec<PresenceEntry> {
        self.presence.roster()
    }

    pub fn typing_peers(&self) -> Vec<UserId> {
        self.presence.typing_peers()
    }

    /// Call on every composer keystroke; typing frames are debounced here.
    pub fn keystroke(&self, recipient_id: &UserId) {
        self.notifier.keystroke(recipient_id);
    }

    pub fn request_user_info(&self, user_id: &UserId) -> bool {
        self.channel.request_user_info(user_id)
    }

    fn ensure_event_loop(self: &Arc<Self>) {
        let mut guard = match self.event_task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let alive = guard.as_ref().is_some_and(|task| !task.is_finished());
        if alive {
            return;
        }
        let session = Arc::clone(self);
        let mut rx = self.channel.subscribe();
        *guard = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => session.handle_channel_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session event loop lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }));
    }

    async fn handle_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => {
                if self.principal.is_privileged {
                    self.channel.request_online_users();
                }
                let _ = self.events.send(SessionEvent::Connected);
            }
            ChannelEvent::Disconnected => {
                let _ = self.events.send(SessionEvent::Disconnected);
            }
            ChannelEvent::TransportError(error) => {
                let _ = self.events.send(SessionEvent::TransportError(error));
            }
            ChannelEvent::Presence(presence) => self.presence.apply(presence),
            ChannelEvent::Message { message, broadcast } => {
                let body = if message.encrypted {
                    self.codec.decrypt(&message.body)
                } else {
                    message.body
                };
                let foreign = message.sender_id != self.principal.id;
                let record = InboundRecord {
                    server_id: message.id,
                    sender_id: message.sender_id,
                    recipient_id: message.recipient_id,
                    sender_display_name: message.sender_name,
                    body,
                    encrypted_on_wire: message.encrypted,
                    timestamp: message.sent_at,
                    broadcast,
                };

                let unread = {
                    let mut state = self.inner.lock().await;
                    state.reconciler.apply_inbound(record);
                    self.write_through(&state).await;
                    unread_count(
                        state.reconciler.history(),
                        state.watermark,
                        &self.principal.id,
                    )
                };
                let _ = self.events.send(SessionEvent::HistoryChanged);
                if foreign {
                    self.sink.publish(unread).await;
                }
            }
        }
    }

    // Cache failures degrade to in-memory only; the session keeps going.
    async fn write_through(&self, state: &SessionState) {
        if let Err(error) = self
            .cache
            .save_history(&self.principal.id, state.reconciler.history())
            .await
        {
            warn!(%error, "failed to write history through to cache");
        }
    }
}
