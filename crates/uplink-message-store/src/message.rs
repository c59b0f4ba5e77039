//! Message model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Correlation token assigned by the transport when a confirmable message is
/// handed over. Opaque to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportToken {
    /// Transport-assigned message id.
    pub message_id: i32,
    /// Transport session the message was published on.
    pub session_id: String,
}

/// Derived lifecycle state of a stored message.
///
/// A message is in exactly one state at any instant; the state is derived
/// from the lifecycle timestamps, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    /// Not yet handed to the transport.
    Unpublished,
    /// Handed to the transport, confirmation pending.
    InFlight,
    /// Fire-and-forget message that has been handed to the transport.
    Delivered,
    /// Acknowledged by the remote peer. Terminal.
    Confirmed,
    /// Abandoned before confirmation. Terminal.
    Dropped,
}

/// One outbound message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Store-assigned id, stable for the record's lifetime.
    pub id: i32,
    pub topic: String,
    /// Delivery-confidence class: 0 is fire-and-forget, anything greater
    /// requires acknowledgment.
    pub qos: i32,
    pub retain: bool,
    /// Lower is more urgent.
    pub priority: i32,
    pub created_on: DateTime<Utc>,
    /// Set when handed to the transport; cleared only by reconnect recovery.
    pub published_on: Option<DateTime<Utc>>,
    /// Transport-assigned correlation id for confirmable messages, -1 until
    /// set.
    pub published_message_id: i32,
    pub confirmed_on: Option<DateTime<Utc>>,
    pub dropped_on: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
    /// Absent on the list queries, which skip payload columns.
    pub payload: Option<Vec<u8>>,
}

impl StoredMessage {
    /// Derive the lifecycle state from the timestamps.
    pub fn state(&self) -> MessageState {
        if self.dropped_on.is_some() {
            MessageState::Dropped
        } else if self.confirmed_on.is_some() {
            MessageState::Confirmed
        } else if self.published_on.is_some() {
            if self.qos == 0 {
                MessageState::Delivered
            } else {
                MessageState::InFlight
            }
        } else {
            MessageState::Unpublished
        }
    }

    /// The transport token, once the message has been published on a session.
    pub fn transport_token(&self) -> Option<TransportToken> {
        self.session_id.as_ref().map(|session_id| TransportToken {
            message_id: self.published_message_id,
            session_id: session_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> StoredMessage {
        StoredMessage {
            id: 1,
            topic: "telemetry/device-7".to_string(),
            qos: 1,
            retain: false,
            priority: 4,
            created_on: Utc::now(),
            published_on: None,
            published_message_id: -1,
            confirmed_on: None,
            dropped_on: None,
            session_id: None,
            payload: None,
        }
    }

    #[test]
    fn test_state_unpublished() {
        assert_eq!(message().state(), MessageState::Unpublished);
    }

    #[test]
    fn test_state_in_flight_requires_qos() {
        let mut m = message();
        m.published_on = Some(Utc::now());
        assert_eq!(m.state(), MessageState::InFlight);

        m.qos = 0;
        assert_eq!(m.state(), MessageState::Delivered);
    }

    #[test]
    fn test_terminal_states_win() {
        let mut m = message();
        m.published_on = Some(Utc::now());
        m.confirmed_on = Some(Utc::now());
        assert_eq!(m.state(), MessageState::Confirmed);

        let mut m = message();
        m.published_on = Some(Utc::now());
        m.dropped_on = Some(Utc::now());
        assert_eq!(m.state(), MessageState::Dropped);
    }

    #[test]
    fn test_transport_token_requires_session() {
        let mut m = message();
        assert!(m.transport_token().is_none());

        m.published_message_id = 77;
        m.session_id = Some("session-1".to_string());
        let token = m.transport_token().unwrap();
        assert_eq!(token.message_id, 77);
        assert_eq!(token.session_id, "session-1");
    }
}
