//! [`RadioAdapter`] backed by btleplug (central role only)

use crate::adapter::{
    ChannelHandle, ChannelInfo, ChunkStream, PeerSighting, RadioAdapter, SightingStream,
};
use crate::error::{RadioError, RadioResult};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cross-platform BLE adapter implementation using btleplug
pub struct BtleplugRadio {
    adapter: Arc<RwLock<Option<Adapter>>>,
    /// Connected peripherals keyed by channel session
    peripherals: Arc<DashMap<Uuid, Peripheral>>,
}

impl BtleplugRadio {
    pub fn new() -> Self {
        Self {
            adapter: Arc::new(RwLock::new(None)),
            peripherals: Arc::new(DashMap::new()),
        }
    }

    /// Lazily pick the first adapter reported by the platform
    async fn ensure_adapter(&self) -> RadioResult<Adapter> {
        if let Some(adapter) = self.adapter.read().await.as_ref() {
            return Ok(adapter.clone());
        }

        let mut adapter_lock = self.adapter.write().await;
        if let Some(adapter) = adapter_lock.as_ref() {
            return Ok(adapter.clone());
        }

        debug!("Creating BLE manager and adapter");
        let manager = Manager::new()
            .await
            .map_err(|e| RadioError::Unavailable(format!("Failed to create BLE manager: {}", e)))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| RadioError::Unavailable(format!("Failed to get adapters: {}", e)))?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| RadioError::Unavailable("No BLE adapter found".to_string()))?;

        info!("BLE adapter initialized: {:?}", adapter.adapter_info().await);
        *adapter_lock = Some(adapter.clone());
        Ok(adapter)
    }

    fn get_peripheral(&self, channel: &ChannelHandle) -> RadioResult<Peripheral> {
        self.peripherals
            .get(&channel.session)
            .map(|p| p.clone())
            .ok_or_else(|| RadioError::NotConnected(channel.peer_id.clone()))
    }

    fn find_characteristic(peripheral: &Peripheral, id: Uuid) -> RadioResult<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == id)
            .ok_or_else(|| RadioError::CharacteristicNotFound(id.to_string()))
    }

    async fn sighting_for(adapter: &Adapter, event: CentralEvent) -> Option<PeerSighting> {
        let id = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
            _ => return None,
        };
        let peripheral = adapter.peripheral(&id).await.ok()?;
        let properties = peripheral.properties().await.ok().flatten()?;

        Some(PeerSighting {
            id: peripheral.address().to_string(),
            name: properties.local_name,
            rssi: properties.rssi.unwrap_or(i16::from(i8::MIN)),
            // btleplug only reports devices it can connect to in central mode
            connectable: true,
        })
    }
}

impl Default for BtleplugRadio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RadioAdapter for BtleplugRadio {
    async fn is_available(&self) -> bool {
        match self.ensure_adapter().await {
            Ok(_) => true,
            Err(e) => {
                warn!("BLE adapter unavailable: {}", e);
                false
            }
        }
    }

    async fn scan(&self, timeout: Duration) -> RadioResult<SightingStream> {
        let adapter = self.ensure_adapter().await?;
        let events = adapter
            .events()
            .await
            .map_err(|e| RadioError::ScanFailed(format!("Failed to open event stream: {}", e)))?;

        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| RadioError::ScanFailed(format!("Failed to start scanning: {}", e)))?;
        info!("BLE scanning started");

        let stream = events
            .filter_map(move |event| {
                let adapter = adapter.clone();
                async move { Self::sighting_for(&adapter, event).await }
            })
            .take_until(tokio::time::sleep(timeout))
            .boxed();
        Ok(stream)
    }

    async fn stop_scan(&self) -> RadioResult<()> {
        let adapter = self.ensure_adapter().await?;
        adapter
            .stop_scan()
            .await
            .map_err(|e| RadioError::ScanFailed(format!("Failed to stop scanning: {}", e)))?;
        info!("BLE scanning stopped");
        Ok(())
    }

    async fn connect(&self, peer_id: &str, timeout: Duration) -> RadioResult<ChannelHandle> {
        let adapter = self.ensure_adapter().await?;
        let peripheral = adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address().to_string() == peer_id)
            .ok_or_else(|| RadioError::DeviceNotFound(peer_id.to_string()))?;

        tokio::time::timeout(timeout, peripheral.connect())
            .await
            .map_err(|_| RadioError::Timeout(format!("connect to {}", peer_id)))?
            .map_err(|e| RadioError::ConnectionFailed(e.to_string()))?;

        let handle = ChannelHandle::new(peer_id);
        self.peripherals.insert(handle.session, peripheral);
        info!("Connected to device: {}", peer_id);
        Ok(handle)
    }

    async fn disconnect(&self, channel: &ChannelHandle) -> RadioResult<()> {
        let Some((_, peripheral)) = self.peripherals.remove(&channel.session) else {
            debug!("Disconnect for unknown channel to {}", channel.peer_id);
            return Ok(());
        };

        peripheral
            .disconnect()
            .await
            .map_err(|e| RadioError::ConnectionFailed(format!("Disconnect failed: {}", e)))?;
        info!("Disconnected from device: {}", channel.peer_id);
        Ok(())
    }

    async fn discover_channels(&self, channel: &ChannelHandle) -> RadioResult<Vec<ChannelInfo>> {
        let peripheral = self.get_peripheral(channel)?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| RadioError::ConnectionFailed(format!("Service discovery failed: {}", e)))?;

        Ok(peripheral
            .characteristics()
            .into_iter()
            .map(|c| ChannelInfo {
                id: c.uuid,
                can_read: c.properties.contains(CharPropFlags::READ),
                can_write: c.properties.contains(CharPropFlags::WRITE)
                    || c.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
                can_notify: c.properties.contains(CharPropFlags::NOTIFY)
                    || c.properties.contains(CharPropFlags::INDICATE),
            })
            .collect())
    }

    async fn write(
        &self,
        channel: &ChannelHandle,
        characteristic: Uuid,
        bytes: &[u8],
    ) -> RadioResult<()> {
        let peripheral = self.get_peripheral(channel)?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;
        let write_type = if target.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        peripheral
            .write(&target, bytes, write_type)
            .await
            .map_err(|e| RadioError::WriteFailed(e.to_string()))
    }

    async fn subscribe_notifications(
        &self,
        channel: &ChannelHandle,
        characteristic: Uuid,
    ) -> RadioResult<ChunkStream> {
        let peripheral = self.get_peripheral(channel)?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;

        peripheral
            .subscribe(&target)
            .await
            .map_err(|e| RadioError::SubscribeFailed(e.to_string()))?;
        let notifications = peripheral
            .notifications()
            .await
            .map_err(|e| RadioError::SubscribeFailed(e.to_string()))?;

        Ok(notifications
            .filter(move |n| futures::future::ready(n.uuid == characteristic))
            .map(|n| n.value)
            .boxed())
    }
}
