use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{MessageId, UserId},
    error::ApiError,
};

/// Frames written by the client over the duplex channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    SendMessage {
        recipient_id: UserId,
        body: String,
        encrypted: bool,
    },
    Typing {
        recipient_id: UserId,
        typing: bool,
    },
    /// Privileged only.
    GetOnlineUsers,
    /// Privileged only.
    GetUserInfo { user_id: UserId },
}

/// A message as it arrives off the wire. `id` is absent for relays that do
/// not assign canonical ids; `body` is ciphertext when `encrypted` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub recipient_id: UserId,
    pub body: String,
    pub encrypted: bool,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineUser {
    pub user_id: UserId,
    pub display_name: String,
}

/// Frames read by the client over the duplex channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    ReceiveMessage(InboundMessage),
    /// Support-originated message to a regular user.
    AdminMessage(InboundMessage),
    /// One-to-many privileged announcement.
    AdminBroadcast(InboundMessage),
    UserTyping {
        sender_id: UserId,
        sender_name: String,
        typing: bool,
    },
    /// Privileged only: full online roster snapshot.
    OnlineUsers { users: Vec<OnlineUser> },
    /// Privileged only: reply to `GetUserInfo`.
    UserInfo {
        user_id: UserId,
        display_name: String,
    },
    UserDisconnected { user_id: UserId },
    Error(ApiError),
}
