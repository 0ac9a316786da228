use ble_radio::RadioError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ProximityError {
    #[error("Radio unavailable: {0}")]
    RadioUnavailable(String),

    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Duplicate transaction: {0}")]
    DuplicateTransaction(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Transmission failed after {sent} of {total} chunks: {reason}")]
    TransmissionFailed {
        sent: usize,
        total: usize,
        reason: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Negotiation already in progress: {0}")]
    NegotiationInProgress(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Service is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<serde_json::Error> for ProximityError {
    fn from(err: serde_json::Error) -> Self {
        ProximityError::SerializationError(err.to_string())
    }
}

impl From<RadioError> for ProximityError {
    fn from(err: RadioError) -> Self {
        match err {
            RadioError::Unavailable(msg) => ProximityError::RadioUnavailable(msg),
            RadioError::ScanFailed(msg) => ProximityError::ScanFailed(msg),
            RadioError::NotConnected(_) => ProximityError::NotConnected,
            RadioError::Timeout(msg) => ProximityError::Timeout(msg),
            RadioError::WriteFailed(msg) => ProximityError::TransmissionFailed {
                sent: 0,
                total: 0,
                reason: msg,
            },
            other => ProximityError::ConnectFailed(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProximityError>;

/// Context for error logging
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub peer_id: Option<String>,
    pub transaction_id: Option<String>,
    pub link_id: Option<u64>,
    pub additional_info: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    pub fn with_link_id(mut self, link_id: u64) -> Self {
        self.link_id = Some(link_id);
        self
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.additional_info = Some(info.into());
        self
    }
}

impl ProximityError {
    /// Log error with structured context
    pub fn log_with_context(&self, context: &ErrorContext) {
        error!(
            error = %self,
            error_kind = %self.kind(),
            peer_id = ?context.peer_id,
            transaction_id = ?context.transaction_id,
            link_id = ?context.link_id,
            additional_info = ?context.additional_info,
            timestamp = %chrono::Utc::now(),
            "Proximity payment error occurred"
        );
    }

    /// Text suitable for the status stream
    pub fn user_message(&self) -> String {
        match self {
            ProximityError::RadioUnavailable(_) => {
                "Bluetooth is unavailable. Please turn Bluetooth on and try again.".to_string()
            }
            ProximityError::ScanFailed(details) => {
                format!("Scanning for nearby devices failed: {}.", details)
            }
            ProximityError::NotConnected => {
                "No device connected. Connect to a nearby device first.".to_string()
            }
            ProximityError::ConnectFailed(details) => {
                format!("Connection failed: {}. Move closer and try again.", details)
            }
            ProximityError::DuplicateTransaction(id) => {
                format!("Transaction '{}' is already in progress.", id)
            }
            ProximityError::MalformedMessage(details) => {
                format!("Received an unreadable message ({}). Ask the sender to retry.", details)
            }
            ProximityError::TransmissionFailed { sent, total, .. } => {
                format!(
                    "Sending failed after {} of {} parts. Please try again.",
                    sent, total
                )
            }
            ProximityError::InvalidInput(details) => {
                format!("Invalid input: {}. Please check your entry and try again.", details)
            }
            ProximityError::NegotiationInProgress(id) => {
                format!("Waiting for a reply to '{}'. Try again once it completes.", id)
            }
            ProximityError::SerializationError(details) => {
                format!("Data processing error: {}. Please try again.", details)
            }
            ProximityError::Timeout(operation) => {
                format!("Operation timed out: {}. Please try again.", operation)
            }
            ProximityError::ShuttingDown => "Nearby payments are shutting down.".to_string(),
            ProximityError::InternalError(details) => {
                format!("An internal error occurred: {}. Please try again.", details)
            }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProximityError::RadioUnavailable(_) => ErrorKind::RadioUnavailable,
            ProximityError::ScanFailed(_) => ErrorKind::ScanFailed,
            ProximityError::NotConnected => ErrorKind::NotConnected,
            ProximityError::ConnectFailed(_) => ErrorKind::ConnectFailed,
            ProximityError::DuplicateTransaction(_) => ErrorKind::DuplicateTransaction,
            ProximityError::MalformedMessage(_) => ErrorKind::MalformedMessage,
            ProximityError::TransmissionFailed { .. } => ErrorKind::TransmissionFailed,
            ProximityError::InvalidInput(_) => ErrorKind::InvalidInput,
            ProximityError::NegotiationInProgress(_) => ErrorKind::NegotiationInProgress,
            ProximityError::SerializationError(_) => ErrorKind::Serialization,
            ProximityError::Timeout(_) => ErrorKind::Timeout,
            ProximityError::ShuttingDown => ErrorKind::ShuttingDown,
            ProximityError::InternalError(_) => ErrorKind::Internal,
        }
    }
}

/// Error kinds carried on status events and returned to programmatic callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RadioUnavailable,
    ScanFailed,
    NotConnected,
    ConnectFailed,
    DuplicateTransaction,
    MalformedMessage,
    TransmissionFailed,
    InvalidInput,
    NegotiationInProgress,
    Serialization,
    Timeout,
    ShuttingDown,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::RadioUnavailable => write!(f, "radio_unavailable"),
            ErrorKind::ScanFailed => write!(f, "scan_failed"),
            ErrorKind::NotConnected => write!(f, "not_connected"),
            ErrorKind::ConnectFailed => write!(f, "connect_failed"),
            ErrorKind::DuplicateTransaction => write!(f, "duplicate_transaction"),
            ErrorKind::MalformedMessage => write!(f, "malformed_message"),
            ErrorKind::TransmissionFailed => write!(f, "transmission_failed"),
            ErrorKind::InvalidInput => write!(f, "invalid_input"),
            ErrorKind::NegotiationInProgress => write!(f, "negotiation_in_progress"),
            ErrorKind::Serialization => write!(f, "serialization"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::ShuttingDown => write!(f, "shutting_down"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}
