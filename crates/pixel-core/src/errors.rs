//! Error hierarchy for the pixel client.
//!
//! None of these ever reach the host application: the tracker converts every
//! failure into a logged no-op or a requeue. The classification exists so the
//! delivery queue and storage wrapper can decide *which* degradation applies.

use thiserror::Error;

/// Failures the pipeline knows how to degrade from.
#[derive(Debug, Error)]
pub enum PixelError {
    /// The storage backend refused a read or write (quota, privacy mode, I/O).
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The collection endpoint answered with a body we could not parse.
    #[error("malformed server response: {0}")]
    MalformedResponse(String),

    /// The request never produced a response (DNS, connect, reset).
    #[error("network error: {0}")]
    Network(String),

    /// The endpoint answered with a non-success status.
    #[error("collection endpoint returned {status}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
    },

    /// The transport has no fire-and-forget primitive, or it rejected the payload.
    #[error("beacon unavailable")]
    BeaconUnavailable,

    /// A tracking verb was called without a usable event name.
    #[error("invalid track call: {0}")]
    InvalidTrackCall(String),

    /// An envelope or stored value could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PixelError {
    /// Whether the delivery queue should put the envelope back and try again.
    ///
    /// Only transport failures qualify: once the endpoint has answered, the
    /// event is considered consumed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::MalformedResponse(_) => "malformed_response",
            Self::Network(_) => "network",
            Self::HttpStatus { .. } => "http_status",
            Self::BeaconUnavailable => "beacon_unavailable",
            Self::InvalidTrackCall(_) => "invalid_track_call",
            Self::Serialization(_) => "serialization",
        }
    }
}

/// Result type for pixel operations.
pub type Result<T> = std::result::Result<T, PixelError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
