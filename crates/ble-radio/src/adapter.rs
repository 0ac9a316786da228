//! BLE adapter abstraction for cross-platform support

use crate::error::RadioResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Custom service UUID advertised by payment-capable devices
pub const SERVICE_UUID: Uuid = Uuid::from_bytes([
    0x00, 0x00, 0xFF, 0xF0, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34, 0xFB,
]);

/// Custom characteristic UUID carrying payment frames
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_bytes([
    0x00, 0x00, 0xFF, 0xF1, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34, 0xFB,
]);

/// One observation of a remote device during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSighting {
    /// Stable identifier of the remote device (address on most platforms)
    pub id: String,
    /// Advertised local name, if any
    pub name: Option<String>,
    /// Received signal strength in dBm
    pub rssi: i16,
    pub connectable: bool,
}

/// Handle to an open connection returned by [`RadioAdapter::connect`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    pub peer_id: String,
    /// Distinguishes successive connections to the same peer
    pub session: Uuid,
}

impl ChannelHandle {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            session: Uuid::new_v4(),
        }
    }
}

/// A characteristic exposed by a connected device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: Uuid,
    pub can_read: bool,
    pub can_write: bool,
    pub can_notify: bool,
}

/// Scan results, ending when the scan stops
pub type SightingStream = BoxStream<'static, PeerSighting>;

/// Inbound notification payloads in delivery order
pub type ChunkStream = BoxStream<'static, Vec<u8>>;

/// Trait for platform-agnostic BLE operations
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// Whether the radio is present and powered
    async fn is_available(&self) -> bool;

    /// Start scanning; the stream ends after `timeout` or on [`stop_scan`](Self::stop_scan)
    async fn scan(&self, timeout: Duration) -> RadioResult<SightingStream>;

    /// Stop an active scan
    async fn stop_scan(&self) -> RadioResult<()>;

    /// Connect to a device
    async fn connect(&self, peer_id: &str, timeout: Duration) -> RadioResult<ChannelHandle>;

    /// Disconnect from a device
    async fn disconnect(&self, channel: &ChannelHandle) -> RadioResult<()>;

    /// List the characteristics of a connected device
    async fn discover_channels(&self, channel: &ChannelHandle) -> RadioResult<Vec<ChannelInfo>>;

    /// Write one chunk and wait for the stack to accept it
    async fn write(
        &self,
        channel: &ChannelHandle,
        characteristic: Uuid,
        bytes: &[u8],
    ) -> RadioResult<()>;

    /// Subscribe to notifications on a characteristic
    async fn subscribe_notifications(
        &self,
        channel: &ChannelHandle,
        characteristic: Uuid,
    ) -> RadioResult<ChunkStream>;
}
