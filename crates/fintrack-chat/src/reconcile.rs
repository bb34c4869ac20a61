//! Canonical merge of local send intents and remote echoes into one ordered,
//! de-duplicated history. Owned exclusively by the session event loop; all
//! methods are synchronous and never touch I/O.

use chrono::{DateTime, Utc};

use fintrack_shared::domain::{DeliveryState, Message, MessageId, Principal, UserId};

/// An inbound message after decryption, ready to merge. `server_id` is kept
/// separate from the local id space: a provisional id is replaced only when
/// the server actually assigned a canonical one.
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub server_id: Option<MessageId>,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub sender_display_name: Option<String>,
    pub body: String,
    pub encrypted_on_wire: bool,
    pub timestamp: DateTime<Utc>,
    pub broadcast: bool,
}

pub struct Reconciler {
    principal_id: UserId,
    history: Vec<Message>,
}

impl Reconciler {
    pub fn new(principal_id: UserId) -> Self {
        Self::resume(principal_id, Vec::new())
    }

    /// Resumes from cached history, e.g. after a reconnect or page reload.
    /// Pending entries stay pending: visible as not-yet-delivered, never
    /// silently dropped.
    pub fn resume(principal_id: UserId, history: Vec<Message>) -> Self {
        let mut reconciler = Self {
            principal_id,
            history,
        };
        reconciler.resort();
        reconciler
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Appends an optimistic `Pending` entry for a locally originated send.
    pub fn record_local(
        &mut self,
        principal: &Principal,
        recipient_id: UserId,
        body: String,
        encrypted: bool,
    ) -> MessageId {
        let message = Message {
            id: MessageId::provisional(),
            sender_id: principal.id.clone(),
            recipient_id,
            sender_display_name: Some(principal.display_name.clone()),
            body,
            encrypted_on_wire: encrypted,
            timestamp: Utc::now(),
            delivery: DeliveryState::Pending,
            broadcast: false,
        };
        let id = message.id.clone();
        self.history.push(message);
        self.resort();
        id
    }

    /// Merges one inbound message. An echo of our own send confirms the
    /// matching optimistic entry in place; everything else appends as
    /// `Confirmed`. When the optimistic entry is gone or the bodies diverge,
    /// the echo is appended anyway: duplicates are tolerated over loss.
    pub fn apply_inbound(&mut self, record: InboundRecord) {
        if record.sender_id == self.principal_id {
            let matched = self.history.iter().rposition(|message| {
                message.delivery == DeliveryState::Pending
                    && message.sender_id == self.principal_id
                    && message.body == record.body
            });
            if let Some(index) = matched {
                let slot = &mut self.history[index];
                if let Some(server_id) = record.server_id {
                    slot.id = server_id;
                }
                slot.timestamp = record.timestamp;
                slot.delivery = DeliveryState::Confirmed;
                self.resort();
                return;
            }
        }

        self.history.push(Message {
            id: record.server_id.unwrap_or_else(MessageId::provisional),
            sender_id: record.sender_id,
            recipient_id: record.recipient_id,
            sender_display_name: record.sender_display_name,
            body: record.body,
            encrypted_on_wire: record.encrypted_on_wire,
            timestamp: record.timestamp,
            delivery: DeliveryState::Confirmed,
            broadcast: record.broadcast,
        });
        self.resort();
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    // Stable sort: equal timestamps keep insertion order.
    fn resort(&mut self) {
        self.history.sort_by_key(|message| message.timestamp);
    }
}
