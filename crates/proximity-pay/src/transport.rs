//! Chunked transport over the link's payment characteristic.
//!
//! Frames carry no header. The receiver concatenates chunks and attempts a
//! JSON decode after each one; an incomplete document simply waits for more.

use crate::config::ProximityConfig;
use crate::error::{ProximityError, Result};
use crate::link::LinkChannel;
use crate::types::PaymentMessage;
use ble_radio::RadioAdapter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Split `payload` into `ceil(len / ceiling)` slices; all but the last are full
pub fn chunk_payload(payload: &[u8], ceiling: usize) -> Vec<&[u8]> {
    payload.chunks(ceiling.max(1)).collect()
}

/// Outbound half: serializes, fragments and writes messages in order
pub struct FrameTransport {
    radio: Arc<dyn RadioAdapter>,
    chunk_size: usize,
    inter_chunk_delay: Duration,
    /// Held for a whole message so chunks of two messages never interleave
    send_lock: Mutex<()>,
}

impl FrameTransport {
    pub fn new(radio: Arc<dyn RadioAdapter>, config: &ProximityConfig) -> Self {
        Self {
            radio,
            chunk_size: config.chunk_size,
            inter_chunk_delay: config.inter_chunk_delay(),
            send_lock: Mutex::new(()),
        }
    }

    /// Returns the number of chunks written
    pub async fn send_message(
        &self,
        channel: &LinkChannel,
        message: &PaymentMessage,
    ) -> Result<usize> {
        let payload = serde_json::to_vec(message)?;
        debug!(
            "Sending {} ({} bytes) on link {}",
            message.transaction_id(),
            payload.len(),
            channel.link_id
        );
        self.send_payload(channel, &payload).await
    }

    /// Write raw bytes chunk by chunk. Stops at the first failed write.
    pub async fn send_payload(&self, channel: &LinkChannel, payload: &[u8]) -> Result<usize> {
        let chunks = chunk_payload(payload, self.chunk_size);
        let total = chunks.len();
        let _guard = self.send_lock.lock().await;

        for (sent, chunk) in chunks.iter().enumerate() {
            if sent > 0 && !self.inter_chunk_delay.is_zero() {
                tokio::time::sleep(self.inter_chunk_delay).await;
            }

            if let Err(e) = self
                .radio
                .write(&channel.handle, channel.characteristic, chunk)
                .await
            {
                warn!(
                    "Chunk {}/{} to {} failed: {}",
                    sent + 1,
                    total,
                    channel.peer_id,
                    e
                );
                return Err(ProximityError::TransmissionFailed {
                    sent,
                    total,
                    reason: e.to_string(),
                });
            }
            debug!("Sent chunk {}/{} ({} bytes)", sent + 1, total, chunk.len());
        }

        Ok(total)
    }
}

/// Result of feeding one chunk into a [`Reassembler`]
#[derive(Debug, Clone, PartialEq)]
pub enum Reassembled {
    Message(PaymentMessage),
    Malformed(String),
}

/// Inbound half: accumulates chunks until they decode
#[derive(Debug)]
pub struct Reassembler {
    buffer: Vec<u8>,
    max_bytes: usize,
}

impl Reassembler {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_bytes,
        }
    }

    /// Append a chunk and return whatever it completed. Empty means "waiting".
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Reassembled> {
        self.buffer.extend_from_slice(chunk);

        let mut results = Vec::new();
        let mut consumed = 0;
        {
            let mut decoder =
                serde_json::Deserializer::from_slice(&self.buffer).into_iter::<PaymentMessage>();
            loop {
                match decoder.next() {
                    Some(Ok(message)) => {
                        consumed = decoder.byte_offset();
                        results.push(Reassembled::Message(message));
                    }
                    Some(Err(e)) if e.is_eof() => break,
                    Some(Err(e)) => {
                        results.push(Reassembled::Malformed(e.to_string()));
                        consumed = self.buffer.len();
                        break;
                    }
                    // Only whitespace left
                    None => {
                        consumed = self.buffer.len();
                        break;
                    }
                }
            }
        }
        self.buffer.drain(..consumed);

        if self.buffer.len() > self.max_bytes {
            results.push(Reassembled::Malformed(format!(
                "message exceeds {} bytes",
                self.max_bytes
            )));
            self.buffer.clear();
        }

        results
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
