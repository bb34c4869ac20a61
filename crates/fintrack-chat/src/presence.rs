//! Who is online and who is typing. The tracker mirrors server presence
//! frames; the notifier debounces our own keystrokes so the peer sees at
//! most one typing transition per burst.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::Utc;
use tokio::sync::broadcast;

use fintrack_shared::domain::{PresenceEntry, UserId};

use crate::{
    channel::{PresenceEvent, SessionChannel},
    session::SessionEvent,
};

#[derive(Clone)]
pub struct PresenceTracker {
    quiet_period: Duration,
    track_roster: bool,
    events: broadcast::Sender<SessionEvent>,
    inner: Arc<Mutex<PresenceInner>>,
}

#[derive(Default)]
struct PresenceInner {
    roster: HashMap<UserId, PresenceEntry>,
    // user -> generation of the latest typing-true frame; a stale generation
    // means a newer frame superseded the expiry task.
    typing: HashMap<UserId, u64>,
    next_generation: u64,
}

impl PresenceTracker {
    pub fn new(
        quiet_period: Duration,
        track_roster: bool,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            quiet_period,
            track_roster,
            events,
            inner: Arc::new(Mutex::new(PresenceInner::default())),
        }
    }

    /// Roster snapshot, ordered by user id for stable rendering.
    pub fn roster(&self) -> Vec<PresenceEntry> {
        let inner = self.lock_inner();
        let mut entries: Vec<_> = inner.roster.values().cloned().collect();
        entries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        entries
    }

    pub fn typing_peers(&self) -> Vec<UserId> {
        let inner = self.lock_inner();
        let mut peers: Vec<_> = inner.typing.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn clear(&self) {
        let mut inner = self.lock_inner();
        inner.roster.clear();
        inner.typing.clear();
    }

    pub fn apply(&self, event: PresenceEvent) {
        match event {
            PresenceEvent::Typing {
                sender_id, typing, ..
            } => {
                if typing {
                    self.note_typing(sender_id);
                } else {
                    self.clear_typing(&sender_id);
                }
            }
            PresenceEvent::Roster { users } => {
                if !self.track_roster {
                    return;
                }
                {
                    let mut inner = self.lock_inner();
                    let mut next = HashMap::with_capacity(users.len());
                    for user in users {
                        // A user already present keeps their original
                        // connected_at across roster refreshes.
                        let connected_at = inner
                            .roster
                            .get(&user.user_id)
                            .map(|entry| entry.connected_at)
                            .unwrap_or_else(Utc::now);
                        next.insert(
                            user.user_id.clone(),
                            PresenceEntry {
                                user_id: user.user_id,
                                display_name: user.display_name,
                                connected_at,
                            },
                        );
                    }
                    inner.roster = next;
                }
                let _ = self.events.send(SessionEvent::RosterChanged);
            }
            PresenceEvent::UserInfo {
                user_id,
                display_name,
            } => {
                let changed = {
                    let mut inner = self.lock_inner();
                    match inner.roster.get_mut(&user_id) {
                        Some(entry) if entry.display_name != display_name => {
                            entry.display_name = display_name;
                            true
                        }
                        _ => false,
                    }
                };
                if changed {
                    let _ = self.events.send(SessionEvent::RosterChanged);
                }
            }
            PresenceEvent::Disconnected { user_id } => {
                let (was_listed, was_typing) = {
                    let mut inner = self.lock_inner();
                    (
                        inner.roster.remove(&user_id).is_some(),
                        inner.typing.remove(&user_id).is_some(),
                    )
                };
                if was_typing {
                    let _ = self.events.send(SessionEvent::TypingChanged {
                        user_id: user_id.clone(),
                        typing: false,
                    });
                }
                if was_listed {
                    let _ = self.events.send(SessionEvent::RosterChanged);
                }
            }
        }
    }

    /// Marks a peer as typing and arms the quiet-period expiry. Peers that
    /// vanish without a typing-false frame are cleared when the period
    /// elapses without a fresher frame.
    fn note_typing(&self, user_id: UserId) {
        let (generation, newly_typing) = {
            let mut inner = self.lock_inner();
            let generation = inner.next_generation;
            inner.next_generation += 1;
            let newly_typing = inner.typing.insert(user_id.clone(), generation).is_none();
            (generation, newly_typing)
        };
        if newly_typing {
            let _ = self.events.send(SessionEvent::TypingChanged {
                user_id: user_id.clone(),
                typing: true,
            });
        }

        let tracker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(tracker.quiet_period).await;
            let expired = {
                let mut inner = tracker.lock_inner();
                if inner.typing.get(&user_id) == Some(&generation) {
                    inner.typing.remove(&user_id);
                    true
                } else {
                    false
                }
            };
            if expired {
                let _ = tracker.events.send(SessionEvent::TypingChanged {
                    user_id,
                    typing: false,
                });
            }
        });
    }

    fn clear_typing(&self, user_id: &UserId) {
        let was_typing = self.lock_inner().typing.remove(user_id).is_some();
        if was_typing {
            let _ = self.events.send(SessionEvent::TypingChanged {
                user_id: user_id.clone(),
                typing: false,
            });
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, PresenceInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Outbound side of typing: a keystroke burst produces one typing-true frame
/// up front and one typing-false frame after a quiet period with no further
/// keystrokes.
#[derive(Clone)]
pub struct TypingNotifier {
    channel: Arc<SessionChannel>,
    quiet_period: Duration,
    inner: Arc<Mutex<NotifierInner>>,
}

#[derive(Default)]
struct NotifierInner {
    typing_to: Option<UserId>,
    generation: u64,
}

impl TypingNotifier {
    pub fn new(channel: Arc<SessionChannel>, quiet_period: Duration) -> Self {
        Self {
            channel,
            quiet_period,
            inner: Arc::new(Mutex::new(NotifierInner::default())),
        }
    }

    pub fn keystroke(&self, recipient_id: &UserId) {
        let (generation, transition) = {
            let mut inner = self.lock_inner();
            inner.generation += 1;
            let transition = inner.typing_to.as_ref() != Some(recipient_id);
            inner.typing_to = Some(recipient_id.clone());
            (inner.generation, transition)
        };
        if transition {
            self.channel.notify_typing(recipient_id, true);
        }

        let notifier = self.clone();
        let recipient = recipient_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(notifier.quiet_period).await;
            let stop = {
                let mut inner = notifier.lock_inner();
                if inner.generation == generation && inner.typing_to.as_ref() == Some(&recipient) {
                    inner.typing_to = None;
                    true
                } else {
                    false
                }
            };
            if stop {
                notifier.channel.notify_typing(&recipient, false);
            }
        });
    }

    /// Immediate typing-false, e.g. when the composer sends or clears.
    pub fn stop(&self, recipient_id: &UserId) {
        let was_typing = {
            let mut inner = self.lock_inner();
            inner.generation += 1;
            inner.typing_to.take().is_some()
        };
        if was_typing {
            self.channel.notify_typing(recipient_id, false);
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, NotifierInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
