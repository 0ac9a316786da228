use crate::error::{ErrorContext, ErrorKind, ProximityError, Result};
use crate::events::EventBus;
use crate::link::{LinkEvent, LinkManager};
use crate::sink::TransactionSink;
use crate::transport::{FrameTransport, Reassembled, Reassembler};
use crate::types::{
    Direction, NegotiationOutcome, NegotiationState, PaymentEvent, PaymentMessage, PaymentRequest,
    PaymentResponse, StatusEvent, StatusKind, TransactionId, TransactionRecord, BLUETOOTH_METHOD,
};
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source of transaction identifiers
pub trait TransactionIdGenerator: Send + Sync {
    fn next_id(&self) -> TransactionId;
}

/// `TXN_<unix millis>_<4 digits>`; the suffix is a counter seeded at random
/// so ids stay unique within a process even in the same millisecond.
pub struct TimestampIdGenerator {
    counter: AtomicU32,
}

impl TimestampIdGenerator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU32::new(rand::thread_rng().gen_range(0..10_000)),
        }
    }
}

impl Default for TimestampIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionIdGenerator for TimestampIdGenerator {
    fn next_id(&self) -> TransactionId {
        let suffix = self.counter.fetch_add(1, Ordering::Relaxed) % 10_000;
        format!("TXN_{}_{:04}", Utc::now().timestamp_millis(), suffix)
    }
}

/// True for ids shaped like `TXN_<digits>_<4 digits>`
pub fn is_valid_transaction_id(id: &str) -> bool {
    let Some(rest) = id.strip_prefix("TXN_") else {
        return false;
    };
    let Some((millis, suffix)) = rest.split_once('_') else {
        return false;
    };
    !millis.is_empty()
        && millis.bytes().all(|b| b.is_ascii_digit())
        && suffix.len() == 4
        && suffix.bytes().all(|b| b.is_ascii_digit())
}

/// What the local user wants to ask the peer for
#[derive(Debug, Clone)]
pub struct PaymentDetails {
    pub sender_name: String,
    pub sender_phone: String,
    pub receiver_name: String,
    pub receiver_phone: String,
    pub amount: Decimal,
    pub description: Option<String>,
}

impl PaymentDetails {
    pub fn new(
        sender_name: impl Into<String>,
        sender_phone: impl Into<String>,
        receiver_name: impl Into<String>,
        receiver_phone: impl Into<String>,
        amount: Decimal,
    ) -> Self {
        Self {
            sender_name: sender_name.into(),
            sender_phone: sender_phone.into(),
            receiver_name: receiver_name.into(),
            receiver_phone: receiver_phone.into(),
            amount,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

struct Negotiation {
    request: PaymentRequest,
    state: NegotiationState,
    direction: Direction,
    link_id: u64,
    created_at: Instant,
}

/// Read-only view of a tracked negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationInfo {
    pub transaction_id: TransactionId,
    pub state: NegotiationState,
    pub direction: Direction,
    pub link_id: u64,
}

type NegotiationMap = HashMap<TransactionId, Negotiation>;

/// Payment state machine on top of the link
pub struct NegotiationEngine {
    link: LinkManager,
    transport: FrameTransport,
    bus: EventBus,
    sink: Arc<dyn TransactionSink>,
    ids: Arc<dyn TransactionIdGenerator>,
    negotiations: Arc<Mutex<NegotiationMap>>,
    max_message_bytes: usize,
    shutdown: CancellationToken,
}

impl NegotiationEngine {
    pub fn new(
        link: LinkManager,
        transport: FrameTransport,
        bus: EventBus,
        sink: Arc<dyn TransactionSink>,
        max_message_bytes: usize,
    ) -> Self {
        Self::with_id_generator(
            link,
            transport,
            bus,
            sink,
            max_message_bytes,
            Arc::new(TimestampIdGenerator::new()),
        )
    }

    pub fn with_id_generator(
        link: LinkManager,
        transport: FrameTransport,
        bus: EventBus,
        sink: Arc<dyn TransactionSink>,
        max_message_bytes: usize,
        ids: Arc<dyn TransactionIdGenerator>,
    ) -> Self {
        Self {
            link,
            transport,
            bus,
            sink,
            ids,
            negotiations: Arc::new(Mutex::new(HashMap::new())),
            max_message_bytes,
            shutdown: CancellationToken::new(),
        }
    }

    /// Build a request, record it as `Sent` and transmit it.
    ///
    /// Returns once every chunk is written; the peer's answer arrives later on
    /// the message stream as [`PaymentEvent::Resolved`].
    pub async fn send_payment_request(&self, details: PaymentDetails) -> Result<PaymentRequest> {
        let channel = self
            .link
            .active_channel()
            .await
            .ok_or(ProximityError::NotConnected)?;

        if details.amount.is_sign_negative() {
            return Err(ProximityError::InvalidInput(format!(
                "amount must not be negative, got {}",
                details.amount
            )));
        }

        let request = PaymentRequest {
            transaction_id: self.ids.next_id(),
            sender_name: details.sender_name,
            sender_phone: details.sender_phone,
            receiver_name: details.receiver_name,
            receiver_phone: details.receiver_phone,
            amount: details.amount,
            description: details.description,
            timestamp: Utc::now(),
        };
        let transaction_id = request.transaction_id.clone();

        {
            let mut negotiations = self.negotiations.lock().await;
            if negotiations.contains_key(&transaction_id) {
                return Err(ProximityError::DuplicateTransaction(transaction_id));
            }
            if let Some(pending_id) = outstanding_on(&negotiations, channel.link_id) {
                return Err(ProximityError::NegotiationInProgress(pending_id));
            }
            negotiations.insert(
                transaction_id.clone(),
                Negotiation {
                    request: request.clone(),
                    state: NegotiationState::Sent,
                    direction: Direction::Sent,
                    link_id: channel.link_id,
                    created_at: Instant::now(),
                },
            );
        }

        info!(
            "Sending payment request {} for {} to {}",
            transaction_id, request.amount, channel.peer_id
        );
        let message = PaymentMessage::Request(request.clone());
        if let Err(err) = self.transport.send_message(&channel, &message).await {
            self.negotiations.lock().await.remove(&transaction_id);
            err.log_with_context(
                &ErrorContext::new()
                    .with_peer_id(channel.peer_id.as_str())
                    .with_transaction_id(transaction_id.as_str())
                    .with_link_id(channel.link_id),
            );
            self.bus.publish_status(StatusEvent::failure(
                StatusKind::Error,
                err.kind(),
                err.user_message(),
            ));
            return Err(err);
        }

        self.bus.publish_status(StatusEvent::new(
            StatusKind::MessageSent,
            format!("Payment request sent to {}", request.receiver_name),
        ));
        Ok(request)
    }

    /// Answer a peer's request. Works even without a local record of it.
    pub async fn send_payment_response(
        &self,
        transaction_id: &str,
        accepted: bool,
        reason: Option<String>,
    ) -> Result<PaymentResponse> {
        let channel = self
            .link
            .active_channel()
            .await
            .ok_or(ProximityError::NotConnected)?;

        let response = PaymentResponse {
            transaction_id: transaction_id.to_string(),
            accepted,
            reason,
            timestamp: Utc::now(),
        };

        info!(
            "Sending payment response {} (accepted: {}) to {}",
            transaction_id, accepted, channel.peer_id
        );
        let message = PaymentMessage::Response(response.clone());
        if let Err(err) = self.transport.send_message(&channel, &message).await {
            err.log_with_context(
                &ErrorContext::new()
                    .with_peer_id(channel.peer_id.as_str())
                    .with_transaction_id(transaction_id)
                    .with_link_id(channel.link_id),
            );
            self.bus.publish_status(StatusEvent::failure(
                StatusKind::Error,
                err.kind(),
                err.user_message(),
            ));
            return Err(err);
        }

        let incoming = {
            let mut negotiations = self.negotiations.lock().await;
            match negotiations.get(transaction_id) {
                Some(n) if n.direction == Direction::Received => {
                    negotiations.remove(transaction_id)
                }
                _ => None,
            }
        };

        let state = if accepted {
            NegotiationState::Accepted
        } else {
            NegotiationState::Rejected
        };
        match incoming {
            Some(negotiation) if accepted => {
                self.record(&negotiation.request, state, Direction::Received).await;
            }
            Some(_) => {}
            None => debug!("Response for {} has no local negotiation record", transaction_id),
        }

        self.bus.publish_status(StatusEvent::new(
            StatusKind::MessageSent,
            if accepted {
                format!("Payment {} accepted", transaction_id)
            } else {
                format!("Payment {} declined", transaction_id)
            },
        ));
        Ok(response)
    }

    /// Apply one decoded inbound message
    pub async fn handle_inbound(&self, link_id: u64, message: PaymentMessage) {
        match message {
            PaymentMessage::Request(request) => self.on_request(link_id, request).await,
            PaymentMessage::Response(response) => self.on_response(response).await,
        }
    }

    /// Track and publish a peer's request. A request arriving while the link
    /// already carries an outstanding negotiation is dropped with an error
    /// status; the peer learns nothing and its own timeout resolves it.
    async fn on_request(&self, link_id: u64, request: PaymentRequest) {
        {
            let mut negotiations = self.negotiations.lock().await;
            if negotiations.contains_key(&request.transaction_id) {
                debug!("Ignoring repeated request {}", request.transaction_id);
                return;
            }
            if let Some(pending_id) = outstanding_on(&negotiations, link_id) {
                drop(negotiations);
                let err = ProximityError::NegotiationInProgress(pending_id);
                warn!(
                    "Ignoring payment request {} on link {}: {}",
                    request.transaction_id, link_id, err
                );
                self.bus.publish_status(StatusEvent::failure(
                    StatusKind::Error,
                    err.kind(),
                    err.user_message(),
                ));
                return;
            }
            negotiations.insert(
                request.transaction_id.clone(),
                Negotiation {
                    request: request.clone(),
                    state: NegotiationState::Received,
                    direction: Direction::Received,
                    link_id,
                    created_at: Instant::now(),
                },
            );
        }

        info!(
            "Received payment request {} for {} from {}",
            request.transaction_id, request.amount, request.sender_name
        );
        let status = format!(
            "Payment request from {}: {}",
            request.sender_name, request.amount
        );
        self.bus.publish_message(PaymentEvent::RequestReceived(request));
        self.bus
            .publish_status(StatusEvent::new(StatusKind::MessageReceived, status));
    }

    async fn on_response(&self, response: PaymentResponse) {
        let negotiation = {
            let mut negotiations = self.negotiations.lock().await;
            match negotiations.get(&response.transaction_id) {
                Some(n) if n.direction == Direction::Sent && n.state == NegotiationState::Sent => {
                    negotiations.remove(&response.transaction_id)
                }
                _ => None,
            }
        };
        let Some(negotiation) = negotiation else {
            debug!("Ignoring response for unknown transaction {}", response.transaction_id);
            return;
        };

        let (state, kind) = if response.accepted {
            (NegotiationState::Accepted, StatusKind::NegotiationAccepted)
        } else {
            (NegotiationState::Rejected, StatusKind::NegotiationRejected)
        };
        info!("Payment request {} {}", response.transaction_id, state);

        let message = match (&response.reason, response.accepted) {
            (_, true) => format!("Payment {} accepted", response.transaction_id),
            (Some(reason), false) => {
                format!("Payment {} declined: {}", response.transaction_id, reason)
            }
            (None, false) => format!("Payment {} declined", response.transaction_id),
        };

        if response.accepted {
            self.record(&negotiation.request, state, Direction::Sent).await;
        }

        self.bus
            .publish_message(PaymentEvent::Resolved(NegotiationOutcome {
                transaction_id: response.transaction_id,
                state,
                reason: response.reason,
                resolved_at: Utc::now(),
            }));
        self.bus.publish_status(StatusEvent::new(kind, message));
    }

    /// Force a pending negotiation to `TimedOut` and drop it
    pub async fn expire(&self, transaction_id: &str) -> Option<NegotiationOutcome> {
        Self::expire_in(&self.negotiations, &self.bus, transaction_id).await
    }

    async fn expire_in(
        negotiations: &Mutex<NegotiationMap>,
        bus: &EventBus,
        transaction_id: &str,
    ) -> Option<NegotiationOutcome> {
        let negotiation = negotiations.lock().await.remove(transaction_id)?;

        info!("Payment negotiation {} timed out", transaction_id);
        let outcome = NegotiationOutcome {
            transaction_id: transaction_id.to_string(),
            state: NegotiationState::TimedOut,
            reason: Some("timed out".to_string()),
            resolved_at: Utc::now(),
        };

        if negotiation.direction == Direction::Sent {
            bus.publish_message(PaymentEvent::Resolved(outcome.clone()));
        }
        bus.publish_status(StatusEvent::failure(
            StatusKind::NegotiationTimedOut,
            ErrorKind::Timeout,
            format!("Payment {} timed out", transaction_id),
        ));
        Some(outcome)
    }

    /// Periodically time out negotiations older than `ttl`
    pub fn start_expiry_task(&self, ttl: Duration, every: Duration) -> JoinHandle<()> {
        let negotiations = Arc::clone(&self.negotiations);
        let bus = self.bus.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut sweep = interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Negotiation expiry task stopping");
                        break;
                    }
                    _ = sweep.tick() => {
                        let expired: Vec<TransactionId> = negotiations
                            .lock()
                            .await
                            .iter()
                            .filter(|(_, n)| {
                                !n.state.is_terminal() && n.created_at.elapsed() >= ttl
                            })
                            .map(|(id, _)| id.clone())
                            .collect();

                        for id in expired {
                            Self::expire_in(&negotiations, &bus, &id).await;
                        }
                    }
                }
            }
        })
    }

    /// Consume link traffic until shutdown, decoding and dispatching messages
    pub async fn run_inbound(&self, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        let mut reassembler = Reassembler::new(self.max_message_bytes);
        let mut current_link = None;

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                LinkEvent::Opened { link_id } => {
                    reassembler.reset();
                    current_link = Some(link_id);
                }
                LinkEvent::Closed { link_id } => {
                    if current_link == Some(link_id) {
                        reassembler.reset();
                        current_link = None;
                    }
                }
                LinkEvent::Chunk { link_id, bytes } => {
                    if current_link != Some(link_id) {
                        debug!("Dropping {} bytes from stale link {}", bytes.len(), link_id);
                        continue;
                    }
                    for result in reassembler.push(&bytes) {
                        match result {
                            Reassembled::Message(message) => {
                                self.handle_inbound(link_id, message).await
                            }
                            Reassembled::Malformed(reason) => {
                                let err = ProximityError::MalformedMessage(reason);
                                warn!("Discarding inbound data on link {}: {}", link_id, err);
                                self.bus.publish_status(StatusEvent::failure(
                                    StatusKind::Error,
                                    err.kind(),
                                    err.user_message(),
                                ));
                            }
                        }
                    }
                }
            }
        }
        debug!("Inbound loop stopped");
    }

    pub async fn negotiation(&self, transaction_id: &str) -> Option<NegotiationInfo> {
        self.negotiations
            .lock()
            .await
            .get(transaction_id)
            .map(|n| NegotiationInfo {
                transaction_id: transaction_id.to_string(),
                state: n.state,
                direction: n.direction,
                link_id: n.link_id,
            })
    }

    pub async fn pending_count(&self) -> usize {
        self.negotiations.lock().await.len()
    }

    /// Stop the inbound loop and expiry task
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn record(
        &self,
        request: &PaymentRequest,
        status: NegotiationState,
        direction: Direction,
    ) {
        let (counterparty_name, counterparty_phone) = match direction {
            Direction::Sent => (&request.receiver_name, &request.receiver_phone),
            Direction::Received => (&request.sender_name, &request.sender_phone),
        };
        let record = TransactionRecord {
            method: BLUETOOTH_METHOD.to_string(),
            counterparty_name: counterparty_name.clone(),
            counterparty_phone: counterparty_phone.clone(),
            amount: request.amount,
            description: request.description.clone(),
            timestamp: Utc::now(),
            status,
            transaction_id: request.transaction_id.clone(),
            direction,
        };

        if let Err(e) = self.sink.record_transaction(record).await {
            warn!(
                "Failed to record transaction {}: {}",
                request.transaction_id, e
            );
        }
    }
}

/// Id of the negotiation still open on `link_id`, whichever side started it
fn outstanding_on(negotiations: &NegotiationMap, link_id: u64) -> Option<TransactionId> {
    negotiations
        .iter()
        .find(|(_, n)| n.link_id == link_id && !n.state.is_terminal())
        .map(|(id, _)| id.clone())
}
