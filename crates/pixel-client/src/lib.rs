//! # pixel-client
//!
//! Client-side event pipeline of the tracking pixel.
//!
//! - **Storage**: durable and session key/value scopes behind the [`Storage`] capability
//! - **Identity**: visitor ID, inactivity-based sessions, UTM attribution, identity traits
//! - **Payload**: envelope construction from identity, page, device and event fields
//! - **Delivery**: FIFO queue with one request in flight, requeue-at-front on failure,
//!   and a beacon/keepalive flush for page exit
//! - **Tracker**: the public verbs (`track`, `page`, `identify`, `track_checkout_event`)
//!   and idempotent bootstrap

#![deny(unsafe_code)]

pub mod delivery;
pub mod environment;
pub mod identity;
pub mod payload;
pub mod storage;
pub mod tracker;
pub mod transport;

#[cfg(test)]
mod testing;

pub use delivery::{DeliveryOutcome, DeliveryQueue, DeliveryStats};
pub use environment::{DeviceContext, Environment, PageContext, StaticEnvironment, UserAgentData};
pub use identity::{IdentityManager, IdentitySnapshot, parse_utm};
pub use payload::{PageOverrides, PayloadBuilder, TrackOptions, classify_device};
pub use storage::{BestEffortStorage, FileStorage, MemoryStorage, Storage, StorageScope};
pub use tracker::{
    BootstrapPhase, PageLifecycle, Tracker, TrackerParts, install, is_conversion_stage,
};
pub use transport::{
    CollectRequest, CollectResponse, Reconciliation, ReqwestTransport, Transport,
};
