use chrono::{DateTime, Utc};

use fintrack_shared::domain::{Message, UserId};

/// Messages not authored by the principal that arrived after the watermark.
/// Pure function over the reconciler's current history; there is no separate
/// unread state to keep in sync.
pub fn unread_count(
    history: &[Message],
    watermark: Option<DateTime<Utc>>,
    principal_id: &UserId,
) -> usize {
    history
        .iter()
        .filter(|message| &message.sender_id != principal_id)
        .filter(|message| watermark.map_or(true, |mark| message.timestamp > mark))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fintrack_shared::domain::{DeliveryState, MessageId};

    fn message(sender: &str, at_secs: i64) -> Message {
        Message {
            id: MessageId::provisional(),
            sender_id: UserId::new(sender),
            recipient_id: UserId::new("me"),
            sender_display_name: None,
            body: "x".into(),
            encrypted_on_wire: false,
            timestamp: Utc.timestamp_opt(at_secs, 0).single().expect("timestamp"),
            delivery: DeliveryState::Confirmed,
            broadcast: false,
        }
    }

    #[test]
    fn counts_foreign_messages_past_the_watermark() {
        let history = vec![message("a", 1), message("me", 2), message("a", 3)];
        let mark = Utc.timestamp_opt(2, 0).single();
        assert_eq!(unread_count(&history, mark, &UserId::new("me")), 1);
    }

    #[test]
    fn no_watermark_counts_every_foreign_message() {
        let history = vec![message("a", 1), message("me", 2), message("a", 3)];
        assert_eq!(unread_count(&history, None, &UserId::new("me")), 2);
    }

    #[test]
    fn own_messages_never_count() {
        let history = vec![message("me", 5), message("me", 6)];
        assert_eq!(unread_count(&history, None, &UserId::new("me")), 0);
    }
}
