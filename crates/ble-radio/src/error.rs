//! Error types for radio operations

use thiserror::Error;

/// Result type for radio operations
pub type RadioResult<T> = Result<T, RadioError>;

/// Errors reported by a [`RadioAdapter`](crate::RadioAdapter)
#[derive(Error, Debug)]
pub enum RadioError {
    #[error("Bluetooth is unavailable: {0}")]
    Unavailable(String),

    #[error("BLE scan failed: {0}")]
    ScanFailed(String),

    #[error("BLE connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Channel not connected: {0}")]
    NotConnected(String),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Notification subscription failed: {0}")]
    SubscribeFailed(String),

    #[error("Radio operation timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(feature = "btleplug")]
impl From<btleplug::Error> for RadioError {
    fn from(err: btleplug::Error) -> Self {
        match &err {
            btleplug::Error::DeviceNotFound => RadioError::DeviceNotFound(err.to_string()),
            btleplug::Error::NotConnected => RadioError::NotConnected(err.to_string()),
            btleplug::Error::PermissionDenied => RadioError::Unavailable(err.to_string()),
            btleplug::Error::TimedOut(d) => RadioError::Timeout(format!("{:?}", d)),
            _ => RadioError::Other(anyhow::anyhow!(err.to_string())),
        }
    }
}
