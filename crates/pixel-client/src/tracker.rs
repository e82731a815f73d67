//! Public tracking API.
//!
//! A [`Tracker`] is the single client-session object of a page load. It owns
//! the identity manager, the payload builder and the delivery queue, and
//! turns the verbs (`track`, `page`, `identify`, `track_checkout_event`) into
//! enqueued envelopes followed by an eager flush.
//!
//! Nothing here surfaces an error to the host. Invalid calls are logged and
//! dropped; delivery problems stay inside the queue.

use std::fmt;
use std::sync::{Arc, OnceLock};

use pixel_core::{EventId, IdentityTraits, PixelError, Result};
use pixel_settings::PixelSettings;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

use crate::delivery::{DeliveryQueue, DeliveryStats};
use crate::environment::Environment;
use crate::identity::{IdentityManager, IdentitySnapshot};
use crate::payload::{PayloadBuilder, TrackOptions};
use crate::storage::{BestEffortStorage, Storage, StorageScope};
use crate::transport::Transport;

/// Event name of page views.
pub const PAGE_VIEW: &str = "PageView";
/// Event name emitted by `identify`.
pub const CONTACT: &str = "Contact";

/// Checkout stages that count as a completed purchase, normalised.
const CONVERSION_STAGES: &[&str] = &[
    "purchase",
    "ordercompleted",
    "orderplaced",
    "checkoutcompleted",
    "ordercomplete",
];

/// Steps of [`Tracker::bootstrap`], logged as they are reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapPhase {
    /// Nothing loaded.
    Uninitialized,
    /// Persisted identity state read from storage.
    StateLoaded,
    /// Visitor ID present.
    IdentityEnsured,
    /// Session ID present and fresh.
    SessionEnsured,
    /// Campaign attribution captured from the landing URL.
    UtmCaptured,
    /// Initial page view queued.
    InitialPageViewEnqueued,
    /// Accepting calls.
    Ready,
}

impl fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::StateLoaded => "state_loaded",
            Self::IdentityEnsured => "identity_ensured",
            Self::SessionEnsured => "session_ensured",
            Self::UtmCaptured => "utm_captured",
            Self::InitialPageViewEnqueued => "initial_page_view_enqueued",
            Self::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Page lifecycle notifications from the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageLifecycle {
    /// The page became hidden.
    VisibilityHidden,
    /// The page became visible again.
    VisibilityVisible,
    /// The page is being hidden for navigation.
    PageHide,
    /// The page is about to unload.
    BeforeUnload,
}

impl PageLifecycle {
    /// Whether the page may be torn down after this notification.
    pub fn is_exit(self) -> bool {
        !matches!(self, Self::VisibilityVisible)
    }
}

/// Backends a tracker is built from.
pub struct TrackerParts {
    /// Host page and device.
    pub environment: Arc<dyn Environment>,
    /// Long-lived storage scope.
    pub durable: Arc<dyn Storage>,
    /// Browsing-session storage scope.
    pub session: Arc<dyn Storage>,
    /// Delivery transport.
    pub transport: Arc<dyn Transport>,
}

/// The client session of one page load.
pub struct Tracker {
    identity: Arc<IdentityManager>,
    builder: PayloadBuilder,
    queue: DeliveryQueue,
    environment: Arc<dyn Environment>,
}

impl Tracker {
    /// Load state, ensure identifiers, capture attribution and queue the
    /// initial page view.
    ///
    /// The page view carries the host's product context, if any. Delivery
    /// starts right away when a tokio runtime is available.
    pub fn bootstrap(settings: &PixelSettings, parts: TrackerParts) -> Self {
        let TrackerParts {
            environment,
            durable,
            session,
            transport,
        } = parts;
        let mut phase = BootstrapPhase::Uninitialized;
        let mut advance = |next: BootstrapPhase| {
            debug!(from = %phase, to = %next, "bootstrap");
            phase = next;
        };

        let identity = Arc::new(IdentityManager::load(
            BestEffortStorage::new(durable, StorageScope::Durable),
            BestEffortStorage::new(session, StorageScope::Session),
            settings.session.timeout(),
        ));
        advance(BootstrapPhase::StateLoaded);

        let visitor_id = identity.ensure_visitor_id();
        advance(BootstrapPhase::IdentityEnsured);

        let session_id = identity.ensure_session_id();
        advance(BootstrapPhase::SessionEnsured);

        let landing = environment.page();
        let utm = identity.persist_utm(&landing.url);
        advance(BootstrapPhase::UtmCaptured);

        let collect_url = settings.collect_url();
        let tracker = Self {
            builder: PayloadBuilder::new(Arc::clone(&identity), Arc::clone(&environment)),
            queue: DeliveryQueue::new(
                collect_url.clone(),
                transport,
                Arc::clone(&identity),
                settings.delivery.retry.clone(),
            ),
            identity,
            environment,
        };

        let properties = tracker.environment.product_context().unwrap_or_default();
        let options = TrackOptions {
            event_id: Some(EventId::new()),
            ..TrackOptions::default()
        };
        tracker.enqueue(PAGE_VIEW, properties, &options);
        advance(BootstrapPhase::InitialPageViewEnqueued);

        advance(BootstrapPhase::Ready);
        info!(
            visitor_id = %visitor_id,
            session_id = %session_id,
            utm_source = utm.as_ref().and_then(|u| u.source.as_deref()),
            collect_url = %collect_url,
            "pixel tracker ready"
        );
        tracker.queue.flush();
        tracker
    }

    /// Record an arbitrary event.
    ///
    /// A blank name is rejected with [`PixelError::InvalidTrackCall`] and
    /// nothing is queued.
    #[instrument(skip_all, fields(event = name))]
    pub fn track(
        &self,
        name: &str,
        properties: Map<String, Value>,
        options: TrackOptions,
    ) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            debug!("dropping track call without event name");
            return Err(PixelError::InvalidTrackCall("event name is empty".into()));
        }
        self.enqueue(name, properties, &options);
        self.queue.flush();
        Ok(())
    }

    /// Record a page view. Each call gets a fresh correlation ID.
    pub fn page(&self, properties: Map<String, Value>) -> EventId {
        let event_id = EventId::new();
        let options = TrackOptions {
            event_id: Some(event_id.clone()),
            ..TrackOptions::default()
        };
        self.enqueue(PAGE_VIEW, properties, &options);
        self.queue.flush();
        event_id
    }

    /// Merge identity traits and emit a `Contact` event carrying them.
    pub fn identify(&self, traits: IdentityTraits) {
        let properties = traits.to_properties();
        let merged = self.identity.persist_identity(traits);
        debug!(has_email = merged.email.is_some(), traits = merged.traits.len(), "identity merged");
        self.enqueue(CONTACT, properties, &TrackOptions::default());
        self.queue.flush();
    }

    /// Record a checkout step; completion stages count as conversions.
    ///
    /// The stage is added to the properties as `checkoutStage`.
    pub fn track_checkout_event(&self, stage: &str, properties: Map<String, Value>) -> Result<()> {
        let stage = stage.trim();
        let mut properties = properties;
        let _ = properties.insert("checkoutStage".into(), Value::String(stage.to_string()));
        let options = TrackOptions {
            is_conversion: is_conversion_stage(stage),
            ..TrackOptions::default()
        };
        self.track(stage, properties, options)
    }

    /// Start delivering queued events in the background.
    pub fn flush(&self) {
        self.queue.flush();
    }

    /// Hand every queued event to the page-exit path. Returns how many.
    pub fn flush_now(&self) -> usize {
        self.queue.flush_now()
    }

    /// Deliver until the queue is empty.
    pub async fn drain(&self) {
        self.queue.drain().await;
    }

    /// React to a lifecycle notification. Exit notifications flush the queue.
    pub fn handle_lifecycle(&self, event: PageLifecycle) -> usize {
        if !event.is_exit() {
            return 0;
        }
        let flushed = self.flush_now();
        debug!(?event, flushed, "lifecycle flush");
        flushed
    }

    /// Read-only view of visitor, session, attribution and identity.
    pub fn get_state(&self) -> IdentitySnapshot {
        self.identity.snapshot()
    }

    /// Delivery queue.
    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    /// Delivery counters.
    pub fn stats(&self) -> DeliveryStats {
        self.queue.stats()
    }

    fn enqueue(&self, name: &str, properties: Map<String, Value>, options: &TrackOptions) {
        let envelope = self.builder.build_payload(name, properties, options);
        debug!(event = name, conversion = envelope.event.is_conversion, "event queued");
        self.queue.enqueue(envelope, options.keepalive);
    }
}

/// Install a tracker into `slot` once.
///
/// `init` runs only for the first call; later calls return the tracker that
/// is already installed without bootstrapping again.
pub fn install(slot: &OnceLock<Tracker>, init: impl FnOnce() -> Tracker) -> &Tracker {
    if let Some(existing) = slot.get() {
        debug!("tracker already installed, skipping bootstrap");
        return existing;
    }
    slot.get_or_init(init)
}

/// Whether a checkout stage label means the order went through.
///
/// Case, spaces, dashes and underscores are ignored.
pub fn is_conversion_stage(stage: &str) -> bool {
    let normalized: String = stage
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    CONVERSION_STAGES.contains(&normalized.as_str())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
