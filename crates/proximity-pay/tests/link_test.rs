// Link lifecycle tests

use ble_radio::{ChannelInfo, MockRadio};
use proximity_pay::{
    ErrorKind, EventBus, LinkEvent, LinkManager, LinkState, ProximityConfig, ProximityError,
    RetryConfig, StatusKind,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

fn manager(
    radio: &MockRadio,
    config: ProximityConfig,
) -> (LinkManager, EventBus, mpsc::UnboundedReceiver<LinkEvent>) {
    let bus = EventBus::new(64);
    let (link, events) = LinkManager::new(Arc::new(radio.clone()), bus.clone(), config);
    (link, bus, events)
}

fn kinds(events: Vec<proximity_pay::StatusEvent>) -> Vec<StatusKind> {
    events.into_iter().map(|e| e.kind).collect()
}

#[tokio::test]
async fn test_connect_then_disconnect() {
    let radio = MockRadio::new();
    let (link, bus, mut events) = manager(&radio, ProximityConfig::default());
    let mut status = bus.subscribe_status();

    let channel = link.connect("AA:BB").await.unwrap();
    assert_eq!(link.state().await, LinkState::Connected);
    assert_eq!(link.active_channel().await, Some(channel.clone()));
    assert!(radio.is_subscribed());

    link.disconnect().await.unwrap();
    assert_eq!(link.state().await, LinkState::Disconnected);
    assert!(link.active_channel().await.is_none());
    assert!(!radio.is_subscribed());
    assert!(radio.connected_channel().is_none());

    assert_eq!(
        kinds(status.drain()),
        vec![
            StatusKind::Connecting,
            StatusKind::Connected,
            StatusKind::Disconnecting,
            StatusKind::Disconnected
        ]
    );
    assert_eq!(
        events.recv().await,
        Some(LinkEvent::Opened {
            link_id: channel.link_id
        })
    );
    assert_eq!(
        events.recv().await,
        Some(LinkEvent::Closed {
            link_id: channel.link_id
        })
    );
}

#[tokio::test]
async fn test_disconnect_twice_equals_once() {
    let radio = MockRadio::new();
    let (link, bus, _events) = manager(&radio, ProximityConfig::default());
    link.connect("AA").await.unwrap();

    let mut status = bus.subscribe_status();
    link.disconnect().await.unwrap();
    link.disconnect().await.unwrap();

    assert_eq!(
        kinds(status.drain()),
        vec![StatusKind::Disconnecting, StatusKind::Disconnected]
    );
    assert_eq!(radio.disconnect_calls(), 1);
}

#[tokio::test]
async fn test_disconnect_when_idle_is_silent() {
    let radio = MockRadio::new();
    let (link, bus, _events) = manager(&radio, ProximityConfig::default());
    let mut status = bus.subscribe_status();

    link.disconnect().await.unwrap();
    assert!(status.try_recv().is_none());
    assert_eq!(radio.disconnect_calls(), 0);
}

#[tokio::test]
async fn test_no_qualifying_channel_fails_connect() {
    let radio = MockRadio::new();
    radio.set_channels(vec![ChannelInfo {
        id: Uuid::from_u128(7),
        can_read: true,
        can_write: false,
        can_notify: true,
    }]);
    let (link, bus, _events) = manager(&radio, ProximityConfig::default());
    let mut status = bus.subscribe_status();

    let err = link.connect("AA").await.unwrap_err();
    assert!(matches!(err, ProximityError::ConnectFailed(_)));
    assert_eq!(link.state().await, LinkState::Disconnected);
    assert!(radio.connected_channel().is_none());

    let events = status.drain();
    assert_eq!(
        kinds(events.clone()),
        vec![
            StatusKind::Connecting,
            StatusKind::ConnectFailed,
            StatusKind::Disconnected
        ]
    );
    assert_eq!(events[1].error, Some(ErrorKind::ConnectFailed));
    assert!(!events[1].message.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_reverts_to_disconnected() {
    let radio = MockRadio::new();
    radio.set_connect_delay(Duration::from_secs(60));
    let config = ProximityConfig {
        connect_timeout_secs: 5,
        ..Default::default()
    };
    let (link, _bus, _events) = manager(&radio, config);

    let err = link.connect("AA").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectFailed);
    assert_eq!(link.state().await, LinkState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_connect_rejected_immediately() {
    let radio = MockRadio::new();
    radio.set_connect_delay(Duration::from_secs(3));
    let (link, _bus, _events) = manager(&radio, ProximityConfig::default());

    let first = tokio::spawn({
        let link = link.clone();
        async move { link.connect("AA").await }
    });
    while link.state().await != LinkState::Connecting {
        tokio::task::yield_now().await;
    }

    let started = tokio::time::Instant::now();
    let err = link.connect("BB").await.unwrap_err();
    assert!(matches!(err, ProximityError::ConnectFailed(_)));
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(link.state().await, LinkState::Connecting);

    let channel = first.await.unwrap().unwrap();
    assert_eq!(channel.peer_id, "AA");
    assert_eq!(link.state().await, LinkState::Connected);
    assert_eq!(radio.connect_calls(), 1);
}

#[tokio::test]
async fn test_connect_replaces_existing_link() {
    let radio = MockRadio::new();
    let (link, bus, _events) = manager(&radio, ProximityConfig::default());
    let first = link.connect("AA").await.unwrap();

    let mut status = bus.subscribe_status();
    let second = link.connect("BB").await.unwrap();

    assert_ne!(first.link_id, second.link_id);
    assert_eq!(radio.disconnect_calls(), 1);
    assert_eq!(link.active_channel().await.unwrap().peer_id, "BB");
    assert_eq!(
        kinds(status.drain()),
        vec![
            StatusKind::Disconnecting,
            StatusKind::Disconnected,
            StatusKind::Connecting,
            StatusKind::Connected
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_retry_with_backoff() {
    let radio = MockRadio::new();
    radio.set_connect_error(Some("gatt busy"));
    let config = ProximityConfig {
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
        },
        ..Default::default()
    };
    let (link, bus, _events) = manager(&radio, config);
    let mut status = bus.subscribe_status();

    let started = tokio::time::Instant::now();
    let err = link.connect("AA").await.unwrap_err();
    assert!(err.to_string().contains("3 attempts"));
    assert_eq!(radio.connect_calls(), 3);
    assert_eq!(started.elapsed(), Duration::from_millis(300));

    // Retries stay inside the single Connecting state
    assert_eq!(
        kinds(status.drain()),
        vec![
            StatusKind::Connecting,
            StatusKind::ConnectFailed,
            StatusKind::Disconnected
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_retry_recovers_on_later_attempt() {
    let radio = MockRadio::new();
    radio.set_connect_error(Some("gatt busy"));
    let config = ProximityConfig {
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
        },
        ..Default::default()
    };
    let (link, _bus, _events) = manager(&radio, config);

    let attempt = tokio::spawn({
        let link = link.clone();
        async move { link.connect("AA").await }
    });
    // First attempt fails at t=0, the second runs after the 100ms backoff
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(radio.connect_calls(), 1);
    radio.set_connect_error(None);

    attempt.await.unwrap().unwrap();
    assert_eq!(radio.connect_calls(), 2);
    assert_eq!(link.state().await, LinkState::Connected);
}

#[tokio::test]
async fn test_link_loss_detected() {
    let radio = MockRadio::new();
    let (link, bus, mut events) = manager(&radio, ProximityConfig::default());
    let channel = link.connect("AA").await.unwrap();
    let mut status = bus.subscribe_status();

    radio.drop_link();

    let lost = tokio::time::timeout(Duration::from_secs(2), status.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lost.kind, StatusKind::LinkLost);
    assert_eq!(link.state().await, LinkState::Disconnected);
    assert!(link.active_channel().await.is_none());

    assert_eq!(
        events.recv().await,
        Some(LinkEvent::Opened {
            link_id: channel.link_id
        })
    );
    assert_eq!(
        events.recv().await,
        Some(LinkEvent::Closed {
            link_id: channel.link_id
        })
    );

    // Already down: nothing more to report
    link.disconnect().await.unwrap();
    assert!(status.try_recv().is_none());
}

#[tokio::test]
async fn test_inbound_chunks_forwarded_with_link_id() {
    let radio = MockRadio::new();
    let (link, _bus, mut events) = manager(&radio, ProximityConfig::default());
    let channel = link.connect("AA").await.unwrap();

    assert!(radio.inject_notification(b"hello"));
    assert_eq!(
        events.recv().await,
        Some(LinkEvent::Opened {
            link_id: channel.link_id
        })
    );
    assert_eq!(
        events.recv().await,
        Some(LinkEvent::Chunk {
            link_id: channel.link_id,
            bytes: b"hello".to_vec()
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_connect_reverts_to_disconnected() {
    let radio = MockRadio::new();
    radio.set_connect_delay(Duration::from_secs(5));
    let (link, bus, _events) = manager(&radio, ProximityConfig::default());
    let mut status = bus.subscribe_status();

    let abandoned = tokio::time::timeout(Duration::from_secs(1), link.connect("AA")).await;
    assert!(abandoned.is_err());

    // The attempt winds down on its own task
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(link.state().await, LinkState::Disconnected);
    assert!(radio.connected_channel().is_none());

    let events = status.drain();
    assert_eq!(
        kinds(events.clone()),
        vec![
            StatusKind::Connecting,
            StatusKind::ConnectFailed,
            StatusKind::Disconnected
        ]
    );
    assert_eq!(events[1].error, Some(ErrorKind::ConnectFailed));

    radio.set_connect_delay(Duration::ZERO);
    let channel = link.connect("AA").await.unwrap();
    assert_eq!(channel.peer_id, "AA");
    assert_eq!(link.state().await, LinkState::Connected);
    assert_eq!(radio.connect_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_connect_skips_remaining_retries() {
    let radio = MockRadio::new();
    radio.set_connect_error(Some("gatt busy"));
    let config = ProximityConfig {
        retry: RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 1000,
            max_backoff_ms: 1000,
        },
        ..Default::default()
    };
    let (link, _bus, _events) = manager(&radio, config);

    let abandoned = tokio::time::timeout(Duration::from_millis(500), link.connect("AA")).await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(radio.connect_calls(), 1);
    assert_eq!(link.state().await, LinkState::Disconnected);
}

#[tokio::test]
async fn test_close_stops_pump_and_refuses_new_links() {
    let radio = MockRadio::new();
    let (link, _bus, _events) = manager(&radio, ProximityConfig::default());
    link.connect("AA").await.unwrap();

    link.close();
    tokio::time::timeout(Duration::from_secs(2), async {
        while radio.inject_notification(b" ") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("notification pump still running");

    let err = link.connect("BB").await.unwrap_err();
    assert!(matches!(err, ProximityError::ShuttingDown));
    assert_eq!(radio.connect_calls(), 1);
}
