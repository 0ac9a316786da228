//! Multi-subscriber broadcast of peer lists, payment events and status lines.
//!
//! Each stream is an independent `tokio::sync::broadcast` channel. There is no
//! replay: a subscriber sees only what is published after it subscribed.

use crate::types::{Peer, PaymentEvent, StatusEvent};
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};

struct Channel<T> {
    name: &'static str,
    sender: RwLock<Option<broadcast::Sender<T>>>,
}

impl<T: Clone + Send + 'static> Channel<T> {
    fn new(name: &'static str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name,
            sender: RwLock::new(Some(sender)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<broadcast::Sender<T>>> {
        self.sender.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<broadcast::Sender<T>>> {
        self.sender.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: T) {
        match self.read().as_ref() {
            // Err only means nobody is listening
            Some(sender) => {
                let _ = sender.send(event);
            }
            None => debug!("Event bus closed, dropping {} event", self.name),
        }
    }

    fn subscribe(&self) -> Subscription<T> {
        let receiver = match self.read().as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(1);
                drop(sender);
                receiver
            }
        };
        Subscription {
            stream: self.name,
            receiver,
        }
    }

    fn close(&self) -> bool {
        self.write().take().is_some()
    }

    fn subscriber_count(&self) -> usize {
        self.read()
            .as_ref()
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

/// Cancellable handle on one event stream. Dropping it unsubscribes.
pub struct Subscription<T> {
    stream: &'static str,
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    /// Next event, or `None` once the bus is closed
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("{} subscriber lagged, skipped {} events", self.stream, n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-published event without waiting
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("{} subscriber lagged, skipped {} events", self.stream, n);
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain everything published so far
    pub fn drain(&mut self) -> Vec<T> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn cancel(self) {}

    pub fn into_stream(self) -> BoxStream<'static, T> {
        stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
        .boxed()
    }
}

struct BusInner {
    peers: Channel<Vec<Peer>>,
    messages: Channel<PaymentEvent>,
    status: Channel<StatusEvent>,
}

/// Shared event bus; cloning yields another handle to the same streams
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                peers: Channel::new("peers", capacity),
                messages: Channel::new("messages", capacity),
                status: Channel::new("status", capacity),
            }),
        }
    }

    pub fn publish_peers(&self, peers: Vec<Peer>) {
        self.inner.peers.publish(peers);
    }

    pub fn publish_message(&self, event: PaymentEvent) {
        self.inner.messages.publish(event);
    }

    pub fn publish_status(&self, status: StatusEvent) {
        debug!("Status: {}", status.message);
        self.inner.status.publish(status);
    }

    pub fn subscribe_peers(&self) -> Subscription<Vec<Peer>> {
        self.inner.peers.subscribe()
    }

    pub fn subscribe_messages(&self) -> Subscription<PaymentEvent> {
        self.inner.messages.subscribe()
    }

    pub fn subscribe_status(&self) -> Subscription<StatusEvent> {
        self.inner.status.subscribe()
    }

    pub fn status_subscriber_count(&self) -> usize {
        self.inner.status.subscriber_count()
    }

    /// Close all three streams. Subscribers drain what is buffered, then end.
    pub fn close(&self) {
        let closed = self.inner.peers.close()
            | self.inner.messages.close()
            | self.inner.status.close();
        if closed {
            debug!("Event bus closed");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
