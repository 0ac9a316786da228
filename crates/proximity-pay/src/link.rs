use crate::config::ProximityConfig;
use crate::error::{ErrorKind, ProximityError, Result};
use crate::events::EventBus;
use crate::types::{LinkState, PeerId, StatusEvent, StatusKind};
use ble_radio::{ChannelHandle, ChannelInfo, ChunkStream, RadioAdapter};
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Raw traffic from the link, consumed by the receive loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Opened { link_id: u64 },
    Chunk { link_id: u64, bytes: Vec<u8> },
    Closed { link_id: u64 },
}

/// The usable payment channel of the current link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkChannel {
    pub link_id: u64,
    pub peer_id: PeerId,
    pub handle: ChannelHandle,
    pub characteristic: Uuid,
}

/// Pick the payment characteristic: the preferred one if usable, then any
/// read/write characteristic that can notify, then any read/write one.
pub fn select_channel(channels: &[ChannelInfo], preferred: Uuid) -> Option<ChannelInfo> {
    let usable = |c: &&ChannelInfo| c.can_read && c.can_write;

    channels
        .iter()
        .filter(usable)
        .find(|c| c.id == preferred)
        .or_else(|| channels.iter().filter(usable).find(|c| c.can_notify))
        .or_else(|| channels.iter().find(usable))
        .cloned()
}

struct ActiveLink {
    channel: LinkChannel,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

struct LinkSlot {
    state: LinkState,
    active: Option<ActiveLink>,
}

struct LinkInner {
    radio: Arc<dyn RadioAdapter>,
    bus: EventBus,
    config: ProximityConfig,
    slot: Mutex<LinkSlot>,
    events: mpsc::UnboundedSender<LinkEvent>,
    next_link_id: AtomicU64,
    /// Parent of every pump and connect-attempt token
    closed: CancellationToken,
}

/// Owns the single link to a peer
#[derive(Clone)]
pub struct LinkManager {
    inner: Arc<LinkInner>,
}

impl LinkManager {
    /// Returns the manager and the receiving end of its traffic
    pub fn new(
        radio: Arc<dyn RadioAdapter>,
        bus: EventBus,
        config: ProximityConfig,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(LinkInner {
                radio,
                bus,
                config,
                slot: Mutex::new(LinkSlot {
                    state: LinkState::Disconnected,
                    active: None,
                }),
                events,
                next_link_id: AtomicU64::new(1),
                closed: CancellationToken::new(),
            }),
        };
        (manager, rx)
    }

    pub async fn state(&self) -> LinkState {
        self.inner.slot.lock().await.state
    }

    pub async fn is_connected(&self) -> bool {
        self.active_channel().await.is_some()
    }

    /// The payment channel, if a link is up
    pub async fn active_channel(&self) -> Option<LinkChannel> {
        let slot = self.inner.slot.lock().await;
        match slot.state {
            LinkState::Connected => slot.active.as_ref().map(|a| a.channel.clone()),
            _ => None,
        }
    }

    /// Open a link to `peer_id`, replacing any current link.
    ///
    /// A call made while another connect or disconnect is in flight is
    /// rejected immediately and does not affect the attempt in progress.
    ///
    /// The attempt runs on its own task. Dropping the returned future abandons
    /// it: the state settles back to `Disconnected` with the usual failure
    /// statuses, and a radio link opened halfway is released.
    pub async fn connect(&self, peer_id: &str) -> Result<LinkChannel> {
        if self.inner.closed.is_cancelled() {
            return Err(ProximityError::ShuttingDown);
        }

        let abandon = self.inner.closed.child_token();
        let _abandon_on_drop = abandon.clone().drop_guard();

        let manager = self.clone();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move { manager.run_connect(&peer_id, abandon).await })
            .await
            .map_err(|e| ProximityError::InternalError(format!("connect task failed: {}", e)))?
    }

    async fn run_connect(&self, peer_id: &str, abandon: CancellationToken) -> Result<LinkChannel> {
        let inner = &self.inner;

        let previous = {
            let mut slot = inner.slot.lock().await;
            if matches!(slot.state, LinkState::Connecting | LinkState::Disconnecting) {
                let err = ProximityError::ConnectFailed(format!(
                    "another connection attempt is in progress ({})",
                    slot.state
                ));
                warn!("Rejected connect to {}: {}", peer_id, err);
                inner.bus.publish_status(StatusEvent::failure(
                    StatusKind::Error,
                    err.kind(),
                    err.user_message(),
                ));
                return Err(err);
            }

            let previous = slot.active.take();
            slot.state = if previous.is_some() {
                LinkState::Disconnecting
            } else {
                LinkState::Connecting
            };
            previous
        };

        if let Some(previous) = previous {
            info!(
                "Replacing link to {} before connecting to {}",
                previous.channel.peer_id, peer_id
            );
            let old_peer = previous.channel.peer_id.clone();
            inner.bus.publish_status(StatusEvent::new(
                StatusKind::Disconnecting,
                format!("Disconnecting from {}...", old_peer),
            ));
            self.release(previous).await;
            inner.bus.publish_status(StatusEvent::new(
                StatusKind::Disconnected,
                format!("Disconnected from {}", old_peer),
            ));
            inner.slot.lock().await.state = LinkState::Connecting;
        }

        info!("Connecting to peer: {}", peer_id);
        inner.bus.publish_status(StatusEvent::new(
            StatusKind::Connecting,
            format!("Connecting to {}...", peer_id),
        ));

        match self.open_with_retry(peer_id, &abandon).await {
            Ok((handle, channel, notifications)) => {
                let link_id = inner.next_link_id.fetch_add(1, Ordering::SeqCst);
                let channel = LinkChannel {
                    link_id,
                    peer_id: peer_id.to_string(),
                    handle,
                    characteristic: channel.id,
                };

                let mut slot = inner.slot.lock().await;
                let _ = inner.events.send(LinkEvent::Opened { link_id });
                let cancel = inner.closed.child_token();
                let pump = tokio::spawn(Self::pump(
                    Arc::clone(inner),
                    link_id,
                    notifications,
                    cancel.clone(),
                ));
                slot.active = Some(ActiveLink {
                    channel: channel.clone(),
                    cancel,
                    pump,
                });
                slot.state = LinkState::Connected;

                info!("Connected to peer {} (link {})", peer_id, link_id);
                inner.bus.publish_status(StatusEvent::new(
                    StatusKind::Connected,
                    format!("Connected to {}", peer_id),
                ));
                Ok(channel)
            }
            Err(err) => {
                error!("Failed to connect to peer {}: {}", peer_id, err);
                // `Failed` is only reported through the ConnectFailed status;
                // the stored state settles on `Disconnected` in the same step.
                let mut slot = inner.slot.lock().await;
                inner.bus.publish_status(StatusEvent::failure(
                    StatusKind::ConnectFailed,
                    err.kind(),
                    err.user_message(),
                ));
                slot.state = LinkState::Disconnected;
                inner
                    .bus
                    .publish_status(StatusEvent::new(StatusKind::Disconnected, "Disconnected"));
                Err(err)
            }
        }
    }

    /// Tear down the current link. No-op when there is none.
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        let active = {
            let mut slot = inner.slot.lock().await;
            if slot.state == LinkState::Disconnecting {
                debug!("Disconnect already in progress");
                return Ok(());
            }
            match slot.active.take() {
                Some(active) => {
                    slot.state = LinkState::Disconnecting;
                    active
                }
                None => {
                    debug!("Disconnect requested with no active link");
                    return Ok(());
                }
            }
        };

        let peer_id = active.channel.peer_id.clone();
        info!("Disconnecting from peer: {}", peer_id);
        inner.bus.publish_status(StatusEvent::new(
            StatusKind::Disconnecting,
            format!("Disconnecting from {}...", peer_id),
        ));

        self.release(active).await;

        inner.slot.lock().await.state = LinkState::Disconnected;
        inner.bus.publish_status(StatusEvent::new(
            StatusKind::Disconnected,
            format!("Disconnected from {}", peer_id),
        ));
        Ok(())
    }

    /// Stop the notification pump and abandon any connect attempt.
    ///
    /// Synchronous so it can run from `Drop`; the radio link itself is only
    /// released by [`disconnect`](Self::disconnect). Later connects fail with
    /// `ShuttingDown`.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    /// Cancel the notification pump first, then release the radio link
    async fn release(&self, active: ActiveLink) {
        let ActiveLink {
            channel,
            cancel,
            pump,
        } = active;

        cancel.cancel();
        if let Err(e) = pump.await {
            warn!("Notification pump for link {} ended abnormally: {}", channel.link_id, e);
        }
        let _ = self.inner.events.send(LinkEvent::Closed {
            link_id: channel.link_id,
        });

        if let Err(e) = self.inner.radio.disconnect(&channel.handle).await {
            warn!("Radio disconnect from {} failed: {}", channel.peer_id, e);
        }
    }

    async fn open_with_retry(
        &self,
        peer_id: &str,
        abandon: &CancellationToken,
    ) -> Result<(ChannelHandle, ChannelInfo, ChunkStream)> {
        let retry = &self.inner.config.retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 0;
        let mut backoff_ms = retry.initial_backoff_ms;

        loop {
            attempt += 1;
            debug!("Connection attempt {} for peer {}", attempt, peer_id);

            match self.open(peer_id, abandon).await {
                Ok(opened) => return Ok(opened),
                Err(e) if abandon.is_cancelled() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    return Err(if max_attempts > 1 {
                        ProximityError::ConnectFailed(format!(
                            "failed after {} attempts: {}",
                            attempt, e
                        ))
                    } else {
                        e
                    });
                }
                Err(e) => {
                    warn!(
                        "Connection attempt {} failed for peer {}: {}. Retrying in {}ms",
                        attempt, peer_id, e, backoff_ms
                    );
                    tokio::select! {
                        biased;
                        _ = abandon.cancelled() => return Err(abandoned()),
                        _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                    }
                    backoff_ms = (backoff_ms * 2).min(retry.max_backoff_ms);
                }
            }
        }
    }

    async fn open(
        &self,
        peer_id: &str,
        abandon: &CancellationToken,
    ) -> Result<(ChannelHandle, ChannelInfo, ChunkStream)> {
        let radio = &self.inner.radio;
        let timeout = self.inner.config.connect_timeout();

        let connecting = tokio::time::timeout(timeout, radio.connect(peer_id, timeout));
        let handle = tokio::select! {
            biased;
            _ = abandon.cancelled() => return Err(abandoned()),
            result = connecting => match result {
                Ok(Ok(handle)) => handle,
                Ok(Err(e)) => return Err(ProximityError::ConnectFailed(e.to_string())),
                Err(_) => {
                    return Err(ProximityError::ConnectFailed(format!(
                        "timed out after {}s",
                        timeout.as_secs()
                    )))
                }
            },
        };

        let resolved = tokio::select! {
            biased;
            _ = abandon.cancelled() => Err(abandoned()),
            result = self.resolve_channel(&handle) => result,
        };
        let resolved = resolved.and_then(|opened| {
            if abandon.is_cancelled() {
                Err(abandoned())
            } else {
                Ok(opened)
            }
        });

        match resolved {
            Ok((channel, notifications)) => Ok((handle, channel, notifications)),
            Err(e) => {
                if let Err(disconnect_err) = radio.disconnect(&handle).await {
                    warn!("Cleanup disconnect from {} failed: {}", peer_id, disconnect_err);
                }
                Err(e)
            }
        }
    }

    async fn resolve_channel(&self, handle: &ChannelHandle) -> Result<(ChannelInfo, ChunkStream)> {
        let radio = &self.inner.radio;
        let channels = radio.discover_channels(handle).await.map_err(|e| {
            ProximityError::ConnectFailed(format!("service discovery failed: {}", e))
        })?;

        let channel = select_channel(&channels, self.inner.config.payment_characteristic)
            .ok_or_else(|| {
                ProximityError::ConnectFailed("peer offers no payment channel".to_string())
            })?;
        debug!("Using characteristic {} on {}", channel.id, handle.peer_id);

        let notifications = if channel.can_notify {
            radio
                .subscribe_notifications(handle, channel.id)
                .await
                .map_err(|e| {
                    ProximityError::ConnectFailed(format!("notification subscribe failed: {}", e))
                })?
        } else {
            debug!("Characteristic {} cannot notify; link is send-only", channel.id);
            futures::stream::pending::<Vec<u8>>().boxed()
        };

        Ok((channel, notifications))
    }

    async fn pump(
        inner: Arc<LinkInner>,
        link_id: u64,
        mut notifications: ChunkStream,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                next = notifications.next() => match next {
                    Some(bytes) => {
                        debug!("Link {} received {} bytes", link_id, bytes.len());
                        let _ = inner.events.send(LinkEvent::Chunk { link_id, bytes });
                    }
                    None => break,
                },
            }
        }
        drop(notifications);

        Self::mark_lost(&inner, link_id).await;
    }

    /// Notification stream ended on its own: the peer is gone
    async fn mark_lost(inner: &LinkInner, link_id: u64) {
        let channel = {
            let mut slot = inner.slot.lock().await;
            let is_current = slot
                .active
                .as_ref()
                .is_some_and(|a| a.channel.link_id == link_id);
            if !is_current || slot.state != LinkState::Connected {
                return;
            }
            slot.state = LinkState::Disconnected;
            slot.active.take().map(|a| a.channel)
        };
        let Some(channel) = channel else {
            return;
        };

        warn!("Connection lost to peer {} (link {})", channel.peer_id, link_id);
        let _ = inner.events.send(LinkEvent::Closed { link_id });
        inner.bus.publish_status(StatusEvent::failure(
            StatusKind::LinkLost,
            ErrorKind::NotConnected,
            format!("Connection lost to {}", channel.peer_id),
        ));

        if let Err(e) = inner.radio.disconnect(&channel.handle).await {
            debug!("Radio disconnect after link loss failed: {}", e);
        }
    }
}

fn abandoned() -> ProximityError {
    ProximityError::ConnectFailed("connect attempt abandoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: Uuid, read: bool, write: bool, notify: bool) -> ChannelInfo {
        ChannelInfo {
            id,
            can_read: read,
            can_write: write,
            can_notify: notify,
        }
    }

    #[test]
    fn test_select_prefers_configured_characteristic() {
        let preferred = Uuid::from_u128(1);
        let other = Uuid::from_u128(2);
        let channels = vec![info(other, true, true, true), info(preferred, true, true, false)];
        assert_eq!(select_channel(&channels, preferred).unwrap().id, preferred);
    }

    #[test]
    fn test_select_falls_back_to_notifying_channel() {
        let plain = Uuid::from_u128(2);
        let notifying = Uuid::from_u128(3);
        let channels = vec![info(plain, true, true, false), info(notifying, true, true, true)];
        assert_eq!(select_channel(&channels, Uuid::from_u128(9)).unwrap().id, notifying);
    }

    #[test]
    fn test_select_accepts_read_write_without_notify() {
        let plain = Uuid::from_u128(2);
        let channels = vec![info(plain, true, true, false)];
        assert_eq!(select_channel(&channels, Uuid::from_u128(9)).unwrap().id, plain);
    }

    #[test]
    fn test_select_rejects_unusable_channels() {
        let preferred = Uuid::from_u128(1);
        let channels = vec![
            info(preferred, true, false, true),
            info(Uuid::from_u128(2), false, true, true),
        ];
        assert!(select_channel(&channels, preferred).is_none());
        assert!(select_channel(&[], preferred).is_none());
    }
}
