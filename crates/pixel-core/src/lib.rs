//! # pixel-core
//!
//! Foundation types, errors, branded IDs, and the event envelope shared by
//! every pixel crate.
//!
//! - **Branded IDs**: `VisitorId`, `SessionId`, `EventId` as newtypes for type safety
//! - **Envelope**: the JSON payload posted to the collection endpoint per tracked event
//! - **Identity / UTM**: visitor traits and campaign attribution with their merge rules
//! - **Errors**: `PixelError` classification via `thiserror`
//! - **Retry**: backoff math for the delivery queue

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod identity;
pub mod ids;
pub mod json;
pub mod retry;
pub mod utm;

pub use envelope::{DeviceInfo, DeviceType, Envelope, EventData, LineItem, PageInfo};
pub use errors::{PixelError, Result};
pub use identity::{Identity, IdentityTraits};
pub use ids::{EventId, SessionId, VisitorId};
pub use json::deep_merge;
pub use retry::RetryPolicy;
pub use utm::UtmParams;
