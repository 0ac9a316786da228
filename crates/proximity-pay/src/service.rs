use crate::config::ProximityConfig;
use crate::discovery::{DiscoveryEngine, ScanOutcome};
use crate::error::{ProximityError, Result};
use crate::events::{EventBus, Subscription};
use crate::link::{LinkChannel, LinkManager};
use crate::negotiation::{
    NegotiationEngine, NegotiationInfo, PaymentDetails, TimestampIdGenerator,
    TransactionIdGenerator,
};
use crate::sink::TransactionSink;
use crate::transport::FrameTransport;
use crate::types::{
    LinkState, NegotiationOutcome, PaymentEvent, PaymentRequest, PaymentResponse, Peer,
    StatusEvent,
};
use ble_radio::RadioAdapter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Wires discovery, link, transport and negotiation around one radio.
///
/// Must be created inside a tokio runtime; the receive loop starts immediately.
pub struct ProximityService {
    config: ProximityConfig,
    bus: EventBus,
    discovery: DiscoveryEngine,
    link: LinkManager,
    negotiation: Arc<NegotiationEngine>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl ProximityService {
    pub fn new(
        radio: Arc<dyn RadioAdapter>,
        sink: Arc<dyn TransactionSink>,
        config: ProximityConfig,
    ) -> Result<Self> {
        Self::with_id_generator(radio, sink, config, Arc::new(TimestampIdGenerator::new()))
    }

    pub fn with_id_generator(
        radio: Arc<dyn RadioAdapter>,
        sink: Arc<dyn TransactionSink>,
        config: ProximityConfig,
        ids: Arc<dyn TransactionIdGenerator>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ProximityError::InvalidInput(e.to_string()))?;

        let bus = EventBus::new(config.event_channel_capacity);
        let discovery = DiscoveryEngine::new(Arc::clone(&radio), bus.clone());
        let (link, link_events) = LinkManager::new(Arc::clone(&radio), bus.clone(), config.clone());
        let transport = FrameTransport::new(radio, &config);
        let negotiation = Arc::new(NegotiationEngine::with_id_generator(
            link.clone(),
            transport,
            bus.clone(),
            sink,
            config.max_message_bytes,
            ids,
        ));

        let receiver = Arc::clone(&negotiation);
        let inbound = tokio::spawn(async move { receiver.run_inbound(link_events).await });

        info!("Proximity payment service started");
        Ok(Self {
            config,
            bus,
            discovery,
            link,
            negotiation,
            tasks: Mutex::new(vec![inbound]),
            shutting_down: AtomicBool::new(false),
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ProximityError::ShuttingDown);
        }
        Ok(())
    }

    /// Scan for the configured window
    pub async fn start_scan(&self) -> Result<ScanOutcome> {
        self.start_scan_for(self.config.scan_timeout()).await
    }

    pub async fn start_scan_for(&self, timeout: Duration) -> Result<ScanOutcome> {
        self.ensure_running()?;
        self.discovery.start_scan(timeout).await
    }

    pub async fn stop_scan(&self) -> Result<()> {
        self.discovery.stop_scan().await
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.discovery.peers().await
    }

    pub async fn peers_by_signal_strength(&self) -> Vec<Peer> {
        self.discovery.peers_by_signal_strength().await
    }

    pub async fn connect(&self, peer_id: &str) -> Result<LinkChannel> {
        self.ensure_running()?;
        self.link.connect(peer_id).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.link.disconnect().await
    }

    pub async fn link_state(&self) -> LinkState {
        self.link.state().await
    }

    pub async fn send_payment_request(&self, details: PaymentDetails) -> Result<PaymentRequest> {
        self.ensure_running()?;
        self.negotiation.send_payment_request(details).await
    }

    pub async fn send_payment_response(
        &self,
        transaction_id: &str,
        accepted: bool,
        reason: Option<String>,
    ) -> Result<PaymentResponse> {
        self.ensure_running()?;
        self.negotiation
            .send_payment_response(transaction_id, accepted, reason)
            .await
    }

    /// Timeout hook for a single negotiation
    pub async fn expire(&self, transaction_id: &str) -> Option<NegotiationOutcome> {
        self.negotiation.expire(transaction_id).await
    }

    pub async fn negotiation(&self, transaction_id: &str) -> Option<NegotiationInfo> {
        self.negotiation.negotiation(transaction_id).await
    }

    /// Sweep stale negotiations in the background until shutdown
    pub async fn start_expiry_task(&self, ttl: Duration, every: Duration) -> Result<()> {
        self.ensure_running()?;
        let task = self.negotiation.start_expiry_task(ttl, every);
        self.tasks.lock().await.push(task);
        Ok(())
    }

    pub fn subscribe_peers(&self) -> Subscription<Vec<Peer>> {
        self.bus.subscribe_peers()
    }

    pub fn subscribe_messages(&self) -> Subscription<PaymentEvent> {
        self.bus.subscribe_messages()
    }

    pub fn subscribe_status(&self) -> Subscription<StatusEvent> {
        self.bus.subscribe_status()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Stop scanning, drop the link, stop background tasks and close the bus
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down proximity payment service");

        if let Err(e) = self.discovery.stop_scan().await {
            warn!("Failed to stop scan during shutdown: {}", e);
        }
        if let Err(e) = self.link.disconnect().await {
            warn!("Failed to disconnect during shutdown: {}", e);
        }
        self.link.close();

        self.negotiation.shutdown();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        self.bus.close();
        info!("Proximity payment service stopped");
    }
}

impl Drop for ProximityService {
    /// Background tasks hold their own handles to the engine and link, so
    /// they are stopped here even when `shutdown()` was never awaited.
    fn drop(&mut self) {
        self.negotiation.shutdown();
        self.link.close();
    }
}
