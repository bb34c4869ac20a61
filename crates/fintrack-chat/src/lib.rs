//! Real-time support messaging for the finance tracker.
//!
//! `ChatSession` is the only entry point applications need: it authenticates
//! the principal, keeps a reconciled message history backed by the local
//! cache, encrypts bodies in transit and tracks presence. The channel
//! reconnects on its own; callers observe state through `SessionEvent`s.

pub mod channel;
pub mod config;
pub mod identity;
pub mod presence;
pub mod reconcile;
pub mod session;
pub mod unread;

use async_trait::async_trait;

pub use channel::{ChannelConfig, ChannelEvent, ChannelState, PresenceEvent, SessionChannel};
pub use config::{load_settings, ChatSettings};
pub use identity::{ClaimsTokenResolver, IdentityError, IdentityResolver};
pub use presence::{PresenceTracker, TypingNotifier};
pub use reconcile::{InboundRecord, Reconciler};
pub use session::{ChatSession, SessionEvent};
pub use unread::unread_count;

/// Host hook for the unread badge. Called with the current count whenever a
/// foreign message lands and with zero when the conversation is marked read.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, unread: usize);
}

/// Sink for hosts without a badge surface.
pub struct NullNotificationSink;

#[async_trait]
impl NotificationSink for NullNotificationSink {
    async fn publish(&self, _unread: usize) {}
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod channel_tests;

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod session_tests;
