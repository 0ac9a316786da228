use crate::error::{ProximityError, Result};
use crate::events::EventBus;
use crate::types::{Peer, PeerId, StatusEvent, StatusKind};
use ble_radio::{PeerSighting, RadioAdapter, SightingStream};
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a call to [`DiscoveryEngine::start_scan`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The scan window elapsed
    Completed { found: usize },
    /// `stop_scan` ended the scan early
    Stopped { found: usize },
    /// Another scan was already running; nothing was done
    AlreadyRunning,
}

struct ActiveScan {
    cancel: CancellationToken,
    finished: watch::Receiver<bool>,
}

#[derive(Default)]
struct ScanState {
    /// Insertion order is the emitted order
    peers: Vec<Peer>,
    index: HashMap<PeerId, usize>,
    active: Option<ActiveScan>,
}

/// Drives radio scans and owns the deduplicated peer list
pub struct DiscoveryEngine {
    radio: Arc<dyn RadioAdapter>,
    bus: EventBus,
    state: Arc<Mutex<ScanState>>,
}

impl DiscoveryEngine {
    pub fn new(radio: Arc<dyn RadioAdapter>, bus: EventBus) -> Self {
        Self {
            radio,
            bus,
            state: Arc::new(Mutex::new(ScanState::default())),
        }
    }

    /// Scan for `timeout`, publishing peer-list snapshots as new peers appear.
    ///
    /// A repeat sighting refreshes signal strength and `last_seen` in place
    /// without publishing; only [`peers`](Self::peers) reflects refreshes.
    ///
    /// Returns once the window elapses or [`stop_scan`](Self::stop_scan) is
    /// called. Calling it while a scan is running does nothing.
    pub async fn start_scan(&self, timeout: Duration) -> Result<ScanOutcome> {
        let (sightings, cancel, finished_tx) = {
            let mut state = self.state.lock().await;
            if state.active.is_some() {
                debug!("BLE scanning already active");
                return Ok(ScanOutcome::AlreadyRunning);
            }

            if !self.radio.is_available().await {
                let err = ProximityError::RadioUnavailable("adapter is off or missing".to_string());
                warn!("Cannot scan: {}", err);
                self.bus.publish_status(StatusEvent::failure(
                    StatusKind::Error,
                    err.kind(),
                    err.user_message(),
                ));
                return Err(err);
            }

            let sightings = match self.radio.scan(timeout).await {
                Ok(stream) => stream,
                Err(e) => {
                    let err = ProximityError::from(e);
                    warn!("Failed to start BLE scan: {}", err);
                    self.bus.publish_status(StatusEvent::failure(
                        StatusKind::Error,
                        err.kind(),
                        err.user_message(),
                    ));
                    return Err(err);
                }
            };

            state.peers.clear();
            state.index.clear();
            self.bus.publish_peers(Vec::new());

            let cancel = CancellationToken::new();
            let (finished_tx, finished_rx) = watch::channel(false);
            state.active = Some(ActiveScan {
                cancel: cancel.clone(),
                finished: finished_rx,
            });

            info!("Starting BLE scan for {:?}", timeout);
            self.bus.publish_status(StatusEvent::new(
                StatusKind::ScanStarted,
                "Scanning for nearby devices...",
            ));
            (sightings, cancel, finished_tx)
        };

        let task = tokio::spawn(Self::run_scan(
            Arc::clone(&self.radio),
            self.bus.clone(),
            Arc::clone(&self.state),
            sightings,
            cancel,
            finished_tx,
        ));

        task.await
            .map_err(|e| ProximityError::InternalError(format!("scan task failed: {}", e)))
    }

    /// Stop a running scan and wait for it to wind down. Safe when idle.
    pub async fn stop_scan(&self) -> Result<()> {
        let mut finished = {
            let state = self.state.lock().await;
            let Some(active) = state.active.as_ref() else {
                debug!("Stop requested but no scan is active");
                return Ok(());
            };

            let finished = active.finished.clone();
            if active.cancel.is_cancelled() {
                finished
            } else {
                info!("Stopping BLE scan");
                active.cancel.cancel();
                self.bus
                    .publish_status(StatusEvent::new(StatusKind::ScanStopped, "Scan stopped"));

                if let Err(e) = self.radio.stop_scan().await {
                    warn!("Radio failed to stop scanning: {}", e);
                }
                finished
            }
        };

        // Sender dropped also means the scan task is gone
        let _ = finished.wait_for(|done| *done).await;
        Ok(())
    }

    pub async fn is_scanning(&self) -> bool {
        self.state.lock().await.active.is_some()
    }

    /// Current peer list in discovery order
    pub async fn peers(&self) -> Vec<Peer> {
        self.state.lock().await.peers.clone()
    }

    /// Current peers, strongest signal first
    pub async fn peers_by_signal_strength(&self) -> Vec<Peer> {
        let mut peers = self.peers().await;
        peers.sort_by(|a, b| b.signal_strength.cmp(&a.signal_strength));
        peers
    }

    async fn run_scan(
        radio: Arc<dyn RadioAdapter>,
        bus: EventBus,
        state: Arc<Mutex<ScanState>>,
        mut sightings: SightingStream,
        cancel: CancellationToken,
        finished: watch::Sender<bool>,
    ) -> ScanOutcome {
        let stopped = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break true,
                next = sightings.next() => match next {
                    Some(sighting) => Self::record_sighting(&state, &bus, sighting).await,
                    None => break false,
                },
            }
        };
        drop(sightings);

        if !stopped {
            if let Err(e) = radio.stop_scan().await {
                warn!("Radio failed to stop scanning: {}", e);
            }
        }

        let found = {
            let mut state = state.lock().await;
            state.active = None;
            state.peers.len()
        };

        info!("BLE scan finished with {} peers", found);
        bus.publish_status(StatusEvent::new(
            StatusKind::ScanFinished,
            format!("Scan finished: {} device(s) found", found),
        ));
        let _ = finished.send(true);

        if stopped {
            ScanOutcome::Stopped { found }
        } else {
            ScanOutcome::Completed { found }
        }
    }

    async fn record_sighting(state: &Mutex<ScanState>, bus: &EventBus, sighting: PeerSighting) {
        let now = Utc::now();
        let mut state = state.lock().await;

        match state.index.get(&sighting.id).copied() {
            Some(position) => {
                let last_seen = now.max(state.peers[position].last_seen);
                state.peers[position] = Peer::from_sighting(&sighting, last_seen);
                debug!("Updated BLE peer {} (rssi {})", sighting.id, sighting.rssi);
            }
            None => {
                let peer = Peer::from_sighting(&sighting, now);
                info!("Discovered new BLE peer: {} ({})", peer.name, peer.id);
                let position = state.peers.len();
                state.index.insert(peer.id.clone(), position);
                state.peers.push(peer);
                bus.publish_peers(state.peers.clone());
            }
        }
    }
}
