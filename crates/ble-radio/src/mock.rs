//! In-memory [`RadioAdapter`] used by tests and simulators.
//!
//! Two mocks can be [`paired`](MockRadio::pair) so that every chunk written on
//! one side is delivered as a notification on the other, which is enough to
//! run a full request/response exchange without hardware.

use crate::adapter::{
    ChannelHandle, ChannelInfo, ChunkStream, PeerSighting, RadioAdapter, SightingStream,
    CHARACTERISTIC_UUID,
};
use crate::error::{RadioError, RadioResult};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Build a sighting for a connectable device
pub fn sighting(id: &str, name: Option<&str>, rssi: i16) -> PeerSighting {
    PeerSighting {
        id: id.to_string(),
        name: name.map(str::to_string),
        rssi,
        connectable: true,
    }
}

struct MockState {
    available: AtomicBool,
    scripted_sightings: Mutex<Vec<PeerSighting>>,
    scan_tx: Mutex<Option<mpsc::UnboundedSender<PeerSighting>>>,
    scan_calls: AtomicUsize,
    stop_scan_calls: AtomicUsize,
    connect_delay: Mutex<Duration>,
    connect_error: Mutex<Option<String>>,
    channels: Mutex<Vec<ChannelInfo>>,
    connected: Mutex<Option<ChannelHandle>>,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    written: Mutex<Vec<Vec<u8>>>,
    fail_writes_after: Mutex<Option<usize>>,
    notify_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    remote: Mutex<Option<Weak<MockState>>>,
}

/// Scriptable radio that never touches real hardware
#[derive(Clone)]
pub struct MockRadio {
    state: Arc<MockState>,
}

impl MockRadio {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                available: AtomicBool::new(true),
                scripted_sightings: Mutex::new(Vec::new()),
                scan_tx: Mutex::new(None),
                scan_calls: AtomicUsize::new(0),
                stop_scan_calls: AtomicUsize::new(0),
                connect_delay: Mutex::new(Duration::ZERO),
                connect_error: Mutex::new(None),
                channels: Mutex::new(vec![ChannelInfo {
                    id: CHARACTERISTIC_UUID,
                    can_read: true,
                    can_write: true,
                    can_notify: true,
                }]),
                connected: Mutex::new(None),
                connect_calls: AtomicUsize::new(0),
                disconnect_calls: AtomicUsize::new(0),
                written: Mutex::new(Vec::new()),
                fail_writes_after: Mutex::new(None),
                notify_tx: Mutex::new(None),
                remote: Mutex::new(None),
            }),
        }
    }

    /// Cross-wire two radios so writes on one arrive as notifications on the other
    pub fn pair(a: &MockRadio, b: &MockRadio) {
        *lock(&a.state.remote) = Some(Arc::downgrade(&b.state));
        *lock(&b.state.remote) = Some(Arc::downgrade(&a.state));
    }

    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
    }

    /// Sightings delivered as soon as the next scan starts
    pub fn script_sightings(&self, sightings: Vec<PeerSighting>) {
        *lock(&self.state.scripted_sightings) = sightings;
    }

    /// Deliver a sighting to the running scan; returns false when not scanning
    pub fn emit_sighting(&self, sighting: PeerSighting) -> bool {
        match lock(&self.state.scan_tx).as_ref() {
            Some(tx) => tx.send(sighting).is_ok(),
            None => false,
        }
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.state.connect_delay) = delay;
    }

    pub fn set_connect_error(&self, error: Option<&str>) {
        *lock(&self.state.connect_error) = error.map(str::to_string);
    }

    pub fn set_channels(&self, channels: Vec<ChannelInfo>) {
        *lock(&self.state.channels) = channels;
    }

    /// Make every write fail once `count` chunks have been accepted
    pub fn fail_writes_after(&self, count: Option<usize>) {
        *lock(&self.state.fail_writes_after) = count;
    }

    /// Push raw bytes to the notification subscriber; returns false when none
    pub fn inject_notification(&self, bytes: &[u8]) -> bool {
        self.state.deliver(bytes)
    }

    /// Simulate the remote device vanishing: the notification stream ends
    pub fn drop_link(&self) {
        lock(&self.state.notify_tx).take();
        lock(&self.state.connected).take();
    }

    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        lock(&self.state.written).clone()
    }

    pub fn clear_written(&self) {
        lock(&self.state.written).clear();
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.state.scan_tx).is_some()
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.state.notify_tx).is_some()
    }

    pub fn connected_channel(&self) -> Option<ChannelHandle> {
        lock(&self.state.connected).clone()
    }

    pub fn scan_calls(&self) -> usize {
        self.state.scan_calls.load(Ordering::SeqCst)
    }

    pub fn stop_scan_calls(&self) -> usize {
        self.state.stop_scan_calls.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.state.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.state.disconnect_calls.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self, channel: &ChannelHandle) -> RadioResult<()> {
        match lock(&self.state.connected).as_ref() {
            Some(current) if current == channel => Ok(()),
            _ => Err(RadioError::NotConnected(channel.peer_id.clone())),
        }
    }
}

impl Default for MockRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl MockState {
    fn deliver(&self, bytes: &[u8]) -> bool {
        match lock(&self.notify_tx).as_ref() {
            Some(tx) => tx.send(bytes.to_vec()).is_ok(),
            None => false,
        }
    }
}

fn receiver_stream<T: Send + 'static>(
    rx: mpsc::UnboundedReceiver<T>,
) -> stream::BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

#[async_trait]
impl RadioAdapter for MockRadio {
    async fn is_available(&self) -> bool {
        self.state.available.load(Ordering::SeqCst)
    }

    async fn scan(&self, timeout: Duration) -> RadioResult<SightingStream> {
        if !self.is_available().await {
            return Err(RadioError::Unavailable("mock radio switched off".to_string()));
        }
        self.state.scan_calls.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        for sighting in lock(&self.state.scripted_sightings).iter() {
            let _ = tx.send(sighting.clone());
        }
        *lock(&self.state.scan_tx) = Some(tx);

        Ok(receiver_stream(rx)
            .take_until(tokio::time::sleep(timeout))
            .boxed())
    }

    async fn stop_scan(&self) -> RadioResult<()> {
        self.state.stop_scan_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.scan_tx).take();
        Ok(())
    }

    async fn connect(&self, peer_id: &str, timeout: Duration) -> RadioResult<ChannelHandle> {
        self.state.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.state.connect_delay);
        if delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(RadioError::Timeout(format!("connect to {}", peer_id)));
        }
        tokio::time::sleep(delay).await;

        if let Some(reason) = lock(&self.state.connect_error).clone() {
            return Err(RadioError::ConnectionFailed(reason));
        }

        let handle = ChannelHandle::new(peer_id);
        *lock(&self.state.connected) = Some(handle.clone());
        debug!("Mock radio connected to {}", peer_id);
        Ok(handle)
    }

    async fn disconnect(&self, channel: &ChannelHandle) -> RadioResult<()> {
        self.state.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        let mut connected = lock(&self.state.connected);
        if connected.as_ref() == Some(channel) {
            connected.take();
            lock(&self.state.notify_tx).take();
        }
        Ok(())
    }

    async fn discover_channels(&self, channel: &ChannelHandle) -> RadioResult<Vec<ChannelInfo>> {
        self.ensure_connected(channel)?;
        Ok(lock(&self.state.channels).clone())
    }

    async fn write(
        &self,
        channel: &ChannelHandle,
        _characteristic: Uuid,
        bytes: &[u8],
    ) -> RadioResult<()> {
        self.ensure_connected(channel)?;

        {
            let mut written = lock(&self.state.written);
            if let Some(limit) = *lock(&self.state.fail_writes_after) {
                if written.len() >= limit {
                    return Err(RadioError::WriteFailed(format!(
                        "mock write rejected after {} chunks",
                        limit
                    )));
                }
            }
            written.push(bytes.to_vec());
        }

        let remote = lock(&self.state.remote).as_ref().and_then(Weak::upgrade);
        if let Some(remote) = remote {
            remote.deliver(bytes);
        }
        Ok(())
    }

    async fn subscribe_notifications(
        &self,
        channel: &ChannelHandle,
        _characteristic: Uuid,
    ) -> RadioResult<ChunkStream> {
        self.ensure_connected(channel)?;
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.state.notify_tx) = Some(tx);
        Ok(receiver_stream(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scan_delivers_scripted_then_live_sightings() {
        let radio = MockRadio::new();
        radio.script_sightings(vec![sighting("AA", Some("Alice"), -40)]);

        let mut scan = radio.scan(Duration::from_secs(5)).await.unwrap();
        assert!(radio.emit_sighting(sighting("BB", None, -70)));

        assert_eq!(scan.next().await.unwrap().id, "AA");
        assert_eq!(scan.next().await.unwrap().id, "BB");

        radio.stop_scan().await.unwrap();
        assert!(scan.next().await.is_none());
        assert!(!radio.emit_sighting(sighting("CC", None, -70)));
    }

    #[tokio::test]
    async fn test_scan_unavailable() {
        let radio = MockRadio::new();
        radio.set_available(false);
        let result = radio.scan(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RadioError::Unavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_stream_ends_after_timeout() {
        let radio = MockRadio::new();
        let mut scan = radio.scan(Duration::from_millis(100)).await.unwrap();
        assert!(scan.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let radio = MockRadio::new();
        radio.set_connect_delay(Duration::from_secs(30));
        let result = radio.connect("AA", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RadioError::Timeout(_))));
        assert!(radio.connected_channel().is_none());
    }

    #[tokio::test]
    async fn test_paired_write_becomes_notification() {
        let a = MockRadio::new();
        let b = MockRadio::new();
        MockRadio::pair(&a, &b);

        let ch_a = a.connect("B", Duration::from_secs(1)).await.unwrap();
        let ch_b = b.connect("A", Duration::from_secs(1)).await.unwrap();
        let mut inbound = b
            .subscribe_notifications(&ch_b, CHARACTERISTIC_UUID)
            .await
            .unwrap();

        a.write(&ch_a, CHARACTERISTIC_UUID, b"hello").await.unwrap();
        assert_eq!(inbound.next().await.unwrap(), b"hello".to_vec());
        assert_eq!(a.written_frames(), vec![b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn test_write_failure_after_limit() {
        let radio = MockRadio::new();
        let channel = radio.connect("AA", Duration::from_secs(1)).await.unwrap();
        radio.fail_writes_after(Some(1));

        radio.write(&channel, CHARACTERISTIC_UUID, b"one").await.unwrap();
        let result = radio.write(&channel, CHARACTERISTIC_UUID, b"two").await;
        assert!(matches!(result, Err(RadioError::WriteFailed(_))));
        assert_eq!(radio.written_frames().len(), 1);
    }

    #[tokio::test]
    async fn test_write_on_stale_channel_rejected() {
        let radio = MockRadio::new();
        let first = radio.connect("AA", Duration::from_secs(1)).await.unwrap();
        radio.disconnect(&first).await.unwrap();

        let result = radio.write(&first, CHARACTERISTIC_UUID, b"late").await;
        assert!(matches!(result, Err(RadioError::NotConnected(_))));
    }
}
