use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);

/// Recipient id addressing "whoever holds the support role" rather than a
/// specific user. Regular users message support through this sentinel.
pub const SUPPORT_RECIPIENT: &str = "support";

impl MessageId {
    /// Provisional id for an optimistic entry. Replaced only if the server
    /// assigns a different canonical id.
    pub fn provisional() -> Self {
        Self(format!("local-{}", Uuid::new_v4()))
    }
}

/// The authenticated party driving one session. Resolved once from the auth
/// token and immutable for the session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: UserId,
    pub display_name: String,
    pub is_privileged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Locally created, not yet echoed back by the channel.
    Pending,
    /// Received from another party or acknowledged as sent.
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_display_name: Option<String>,
    /// Plaintext. Encryption applies to wire transport only, never to the
    /// local copy.
    pub body: String,
    pub encrypted_on_wire: bool,
    pub timestamp: DateTime<Utc>,
    pub delivery: DeliveryState,
    #[serde(default)]
    pub broadcast: bool,
}

/// One online user as seen by a privileged session. Lifecycle is tied to the
/// connection: created on connect, destroyed on disconnect, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub display_name: String,
    pub connected_at: DateTime<Utc>,
}
