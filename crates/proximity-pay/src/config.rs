use ble_radio::CHARACTERISTIC_UUID;
use serde::Deserialize;
use std::env;
use std::time::Duration;
use uuid::Uuid;

/// Tunables for the proximity payment core
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProximityConfig {
    /// Chunk ceiling in bytes
    pub chunk_size: usize,
    pub inter_chunk_delay_ms: u64,
    pub scan_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Upper bound for a partially reassembled message
    pub max_message_bytes: usize,
    pub event_channel_capacity: usize,
    /// Characteristic preferred when resolving the payment channel
    pub payment_characteristic: Uuid,
    pub retry: RetryConfig,
}

/// Configuration for connection retry logic
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 100,
            max_backoff_ms: 5000,
        }
    }
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            chunk_size: 180,
            inter_chunk_delay_ms: 20,
            scan_timeout_secs: 10,
            connect_timeout_secs: 10,
            max_message_bytes: 16 * 1024,
            event_channel_capacity: 64,
            payment_characteristic: CHARACTERISTIC_UUID,
            retry: RetryConfig::default(),
        }
    }
}

impl ProximityConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            chunk_size: env::var("PROXIMITY_CHUNK_SIZE")
                .unwrap_or_else(|_| defaults.chunk_size.to_string())
                .parse()?,
            inter_chunk_delay_ms: env::var("PROXIMITY_INTER_CHUNK_DELAY_MS")
                .unwrap_or_else(|_| defaults.inter_chunk_delay_ms.to_string())
                .parse()?,
            scan_timeout_secs: env::var("PROXIMITY_SCAN_TIMEOUT_SECS")
                .unwrap_or_else(|_| defaults.scan_timeout_secs.to_string())
                .parse()?,
            connect_timeout_secs: env::var("PROXIMITY_CONNECT_TIMEOUT_SECS")
                .unwrap_or_else(|_| defaults.connect_timeout_secs.to_string())
                .parse()?,
            max_message_bytes: env::var("PROXIMITY_MAX_MESSAGE_BYTES")
                .unwrap_or_else(|_| defaults.max_message_bytes.to_string())
                .parse()?,
            event_channel_capacity: env::var("PROXIMITY_EVENT_CHANNEL_CAPACITY")
                .unwrap_or_else(|_| defaults.event_channel_capacity.to_string())
                .parse()?,
            payment_characteristic: env::var("PROXIMITY_PAYMENT_CHARACTERISTIC")
                .unwrap_or_else(|_| defaults.payment_characteristic.to_string())
                .parse()?,
            retry: RetryConfig {
                max_attempts: env::var("PROXIMITY_CONNECT_MAX_ATTEMPTS")
                    .unwrap_or_else(|_| defaults.retry.max_attempts.to_string())
                    .parse()?,
                initial_backoff_ms: env::var("PROXIMITY_CONNECT_INITIAL_BACKOFF_MS")
                    .unwrap_or_else(|_| defaults.retry.initial_backoff_ms.to_string())
                    .parse()?,
                max_backoff_ms: env::var("PROXIMITY_CONNECT_MAX_BACKOFF_MS")
                    .unwrap_or_else(|_| defaults.retry.max_backoff_ms.to_string())
                    .parse()?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be greater than zero");
        }
        if self.event_channel_capacity == 0 {
            anyhow::bail!("event_channel_capacity must be greater than zero");
        }
        if self.max_message_bytes < self.chunk_size {
            anyhow::bail!(
                "max_message_bytes ({}) must be at least chunk_size ({})",
                self.max_message_bytes,
                self.chunk_size
            );
        }
        Ok(())
    }

    pub fn inter_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.inter_chunk_delay_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
