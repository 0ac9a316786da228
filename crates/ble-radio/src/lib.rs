//! Radio abstraction for short-range payment links
//!
//! This crate defines the [`RadioAdapter`] contract consumed by the proximity
//! payment core, an in-memory [`MockRadio`], and (with the `btleplug`
//! feature) a real adapter over the platform Bluetooth stack.

pub mod adapter;
pub mod error;
pub mod mock;

#[cfg(feature = "btleplug")]
pub mod btle;

// Re-export main types
pub use adapter::{
    ChannelHandle, ChannelInfo, ChunkStream, PeerSighting, RadioAdapter, SightingStream,
    CHARACTERISTIC_UUID, SERVICE_UUID,
};
pub use error::{RadioError, RadioResult};
pub use mock::MockRadio;

#[cfg(feature = "btleplug")]
pub use btle::BtleplugRadio;
