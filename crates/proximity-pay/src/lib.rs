pub mod types;
pub mod error;
pub mod config;
pub mod events;
pub mod discovery;
pub mod link;
pub mod transport;
pub mod negotiation;
pub mod sink;
pub mod service;

pub use types::*;
pub use error::{ProximityError, Result, ErrorContext, ErrorKind};
pub use config::{ProximityConfig, RetryConfig};
pub use events::{EventBus, Subscription};
pub use discovery::{DiscoveryEngine, ScanOutcome};
pub use link::{LinkChannel, LinkEvent, LinkManager};
pub use transport::{chunk_payload, FrameTransport, Reassembled, Reassembler};
pub use negotiation::{
    NegotiationEngine, NegotiationInfo, PaymentDetails, TimestampIdGenerator,
    TransactionIdGenerator,
};
pub use sink::{MemorySink, TransactionSink};
pub use service::ProximityService;
