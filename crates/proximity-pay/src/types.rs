use crate::error::ErrorKind;
use ble_radio::PeerSighting;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Unique identifier for a peer
pub type PeerId = String;

/// `TXN_<unix millis>_<4 digits>`
pub type TransactionId = String;

/// Display name used when a device advertises none
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// Method tag written into transaction records
pub const BLUETOOTH_METHOD: &str = "bluetooth";

/// A discovered peer. Snapshots are immutable; a new sighting replaces the entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    /// dBm, higher is stronger
    pub signal_strength: i16,
    pub connectable: bool,
    pub last_seen: DateTime<Utc>,
}

impl Peer {
    pub fn from_sighting(sighting: &PeerSighting, seen_at: DateTime<Utc>) -> Self {
        let name = sighting
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(UNKNOWN_DEVICE_NAME)
            .to_string();

        Self {
            id: sighting.id.clone(),
            name,
            signal_strength: sighting.rssi,
            connectable: sighting.connectable,
            last_seen: seen_at,
        }
    }
}

/// Lifecycle of the single link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// Transient; a failed connect is observed as `Disconnected` plus a
    /// `ConnectFailed` status
    Failed,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "Disconnected"),
            LinkState::Connecting => write!(f, "Connecting"),
            LinkState::Connected => write!(f, "Connected"),
            LinkState::Disconnecting => write!(f, "Disconnecting"),
            LinkState::Failed => write!(f, "Failed"),
        }
    }
}

/// Payment request as it travels on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub transaction_id: TransactionId,
    pub sender_name: String,
    pub sender_phone: String,
    pub receiver_name: String,
    pub receiver_phone: String,
    pub amount: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Accept/reject answer to a [`PaymentRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResponse {
    pub transaction_id: TransactionId,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Messages exchanged once a link is up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentMessage {
    Request(PaymentRequest),
    Response(PaymentResponse),
}

impl PaymentMessage {
    pub fn transaction_id(&self) -> &str {
        match self {
            PaymentMessage::Request(request) => &request.transaction_id,
            PaymentMessage::Response(response) => &response.transaction_id,
        }
    }
}

/// State of a tracked negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    /// Request transmitted, awaiting the peer's response
    Sent,
    /// Request received, awaiting the local decision
    Received,
    Accepted,
    Rejected,
    TimedOut,
}

impl NegotiationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NegotiationState::Accepted | NegotiationState::Rejected | NegotiationState::TimedOut
        )
    }
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegotiationState::Sent => write!(f, "Sent"),
            NegotiationState::Received => write!(f, "Received"),
            NegotiationState::Accepted => write!(f, "Accepted"),
            NegotiationState::Rejected => write!(f, "Rejected"),
            NegotiationState::TimedOut => write!(f, "TimedOut"),
        }
    }
}

/// Which side of the payment this device played
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

/// Terminal result of an outgoing negotiation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationOutcome {
    pub transaction_id: TransactionId,
    pub state: NegotiationState,
    pub reason: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

/// Events on the message stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentEvent {
    /// A peer asked us to pay; the UI decides
    RequestReceived(PaymentRequest),
    /// One of our requests reached a terminal state
    Resolved(NegotiationOutcome),
}

/// What a status event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    ScanStarted,
    ScanStopped,
    ScanFinished,
    Connecting,
    Connected,
    ConnectFailed,
    Disconnecting,
    Disconnected,
    LinkLost,
    MessageSent,
    MessageReceived,
    NegotiationAccepted,
    NegotiationRejected,
    NegotiationTimedOut,
    Error,
}

/// Human-readable status line, ready for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub kind: StatusKind,
    pub message: String,
    pub error: Option<ErrorKind>,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(kind: StatusKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(kind: StatusKind, error: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            error: Some(error),
            timestamp: Utc::now(),
        }
    }
}

/// Completed transaction handed to the history sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub method: String,
    pub counterparty_name: String,
    pub counterparty_phone: String,
    pub amount: Decimal,
    pub description: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: NegotiationState,
    pub transaction_id: TransactionId,
    pub direction: Direction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_name_falls_back_to_unknown() {
        let sighting = PeerSighting {
            id: "AA:BB".to_string(),
            name: Some("   ".to_string()),
            rssi: -60,
            connectable: true,
        };
        let peer = Peer::from_sighting(&sighting, Utc::now());
        assert_eq!(peer.name, UNKNOWN_DEVICE_NAME);

        let sighting = PeerSighting { name: None, ..sighting };
        assert_eq!(Peer::from_sighting(&sighting, Utc::now()).name, UNKNOWN_DEVICE_NAME);
    }

    #[test]
    fn test_payment_message_wire_shape() {
        let message = PaymentMessage::Response(PaymentResponse {
            transaction_id: "TXN_1_0001".to_string(),
            accepted: false,
            reason: Some("declined".to_string()),
            timestamp: Utc::now(),
        });

        let json: serde_json::Value = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "response");
        assert_eq!(json["transactionId"], "TXN_1_0001");
        assert_eq!(json["accepted"], false);
        assert_eq!(json["reason"], "declined");
    }

    #[test]
    fn test_request_without_description_omits_field() {
        let message = PaymentMessage::Request(PaymentRequest {
            transaction_id: "TXN_1_0002".to_string(),
            sender_name: "A".to_string(),
            sender_phone: "+1".to_string(),
            receiver_name: "B".to_string(),
            receiver_phone: "+2".to_string(),
            amount: Decimal::new(2500, 1),
            description: None,
            timestamp: Utc::now(),
        });

        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"type\":\"request\""));
        assert!(!json.contains("description"));
        let decoded: PaymentMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!NegotiationState::Sent.is_terminal());
        assert!(!NegotiationState::Received.is_terminal());
        assert!(NegotiationState::Accepted.is_terminal());
        assert!(NegotiationState::Rejected.is_terminal());
        assert!(NegotiationState::TimedOut.is_terminal());
    }
}
