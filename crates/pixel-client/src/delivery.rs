//! Sequential delivery of envelopes to the collection endpoint.
//!
//! Each envelope moves through `Queued -> Sending -> {Delivered | Requeued}`.
//! The queue is a plain FIFO except that an envelope whose send failed at the
//! transport level goes back to the *front*, so it is retried before anything
//! queued after it.
//!
//! - A single `sending` flag guarantees at most one request in flight. The
//!   holder keeps sending until the queue is empty, so draining is
//!   self-driving rather than polled.
//! - 2xx responses may carry `{visitorId, sessionId}`; those overwrite the
//!   local identifiers. Because sends are strictly sequential, two responses
//!   can never race each other's overwrite.
//! - Non-2xx responses consume the envelope: the endpoint answered.
//! - [`DeliveryQueue::flush_now`] is the page-exit path: everything queued is
//!   handed to the transport's beacon (or a detached keepalive POST) without
//!   waiting and without retry.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use pixel_core::{Envelope, PixelError, RetryPolicy, SessionId, VisitorId};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::identity::IdentityManager;
use crate::transport::{CollectRequest, CollectResponse, Transport};

/// Result of a single send attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 2xx from the endpoint.
    Delivered,
    /// The endpoint answered with a non-success status; the envelope is consumed.
    Rejected {
        /// HTTP status code.
        status: u16,
    },
    /// Transport failure; the envelope is back at the front of the queue.
    Requeued,
    /// The envelope was discarded (retry budget exhausted or unserializable).
    Dropped,
    /// Nothing was queued.
    Idle,
    /// Another send is in flight.
    Busy,
}

/// Counters since construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Envelopes acknowledged with 2xx.
    pub delivered: u64,
    /// Envelopes answered with a non-success status.
    pub rejected: u64,
    /// Transport failures that put an envelope back.
    pub requeued: u64,
    /// Envelopes discarded.
    pub dropped: u64,
    /// Envelopes handed to the beacon primitive on page exit.
    pub beacons: u64,
    /// Envelopes sent as detached keepalive POSTs on page exit.
    pub keepalive_fallbacks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    rejected: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
    beacons: AtomicU64,
    keepalive_fallbacks: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, outcome: &'static str) {
        let _ = counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("pixel_envelopes_total", "outcome" => outcome).increment(1);
    }
}

#[derive(Clone, Debug)]
struct QueuedEnvelope {
    envelope: Envelope,
    keepalive: bool,
    attempts: u32,
}

struct QueueInner {
    collect_url: String,
    transport: Arc<dyn Transport>,
    identity: Arc<IdentityManager>,
    retry: RetryPolicy,
    pending: Mutex<VecDeque<QueuedEnvelope>>,
    sending: AtomicBool,
    idle: Notify,
    consecutive_failures: AtomicU32,
    counters: Counters,
    runtime: Option<Handle>,
}

/// Releases the `sending` flag and wakes idle waiters, even if the send
/// future is dropped mid-flight.
struct SendingGuard<'a> {
    inner: &'a QueueInner,
}

impl Drop for SendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.sending.store(false, Ordering::Release);
        self.inner.idle.notify_waiters();
    }
}

/// In-memory FIFO of envelopes with at-most-one-in-flight delivery.
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<QueueInner>,
}

impl DeliveryQueue {
    /// Create a queue posting to `collect_url`.
    ///
    /// Background work ([`flush`](Self::flush) and keepalive fallbacks) runs on
    /// the tokio runtime current at construction; without one, only the
    /// awaitable [`drain`](Self::drain) delivers.
    pub fn new(
        collect_url: impl Into<String>,
        transport: Arc<dyn Transport>,
        identity: Arc<IdentityManager>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                collect_url: collect_url.into(),
                transport,
                identity,
                retry,
                pending: Mutex::new(VecDeque::new()),
                sending: AtomicBool::new(false),
                idle: Notify::new(),
                consecutive_failures: AtomicU32::new(0),
                counters: Counters::default(),
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    /// Collection URL this queue posts to.
    pub fn collect_url(&self) -> &str {
        &self.inner.collect_url
    }

    /// Append an envelope.
    pub fn enqueue(&self, envelope: Envelope, keepalive: bool) {
        self.inner.pending.lock().push_back(QueuedEnvelope {
            envelope,
            keepalive,
            attempts: 0,
        });
    }

    /// Number of queued envelopes (excluding one in flight).
    pub fn len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.pending.lock().is_empty()
    }

    /// Whether a send is in flight.
    pub fn is_sending(&self) -> bool {
        self.inner.sending.load(Ordering::Acquire)
    }

    /// Copy of the queued envelopes, front first.
    pub fn pending(&self) -> Vec<Envelope> {
        self.inner
            .pending
            .lock()
            .iter()
            .map(|item| item.envelope.clone())
            .collect()
    }

    /// Counters since construction.
    pub fn stats(&self) -> DeliveryStats {
        let c = &self.inner.counters;
        DeliveryStats {
            delivered: c.delivered.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            beacons: c.beacons.load(Ordering::Relaxed),
            keepalive_fallbacks: c.keepalive_fallbacks.load(Ordering::Relaxed),
        }
    }

    /// Start draining in the background.
    ///
    /// No-op while a send is in flight or when the queue is empty.
    pub fn flush(&self) {
        if self.is_sending() || self.is_empty() {
            return;
        }
        let Some(runtime) = &self.inner.runtime else {
            debug!("no tokio runtime, flush deferred until drain");
            return;
        };
        let queue = self.clone();
        let _ = runtime.spawn(async move { queue.drain().await });
    }

    /// Deliver until the queue is empty and nothing is in flight.
    ///
    /// If another task is already sending, waits for it to finish and takes
    /// over whatever is left. Never returns while a transport failure keeps
    /// requeueing under an unbounded retry policy.
    pub async fn drain(&self) {
        loop {
            let idle = self.inner.idle.notified();
            match self.try_acquire() {
                Some(guard) => {
                    self.send_until_idle().await;
                    drop(guard);
                }
                None => idle.await,
            }
            if !self.is_sending() && self.is_empty() {
                return;
            }
        }
    }

    /// Make exactly one send attempt with the oldest envelope.
    pub async fn attempt_once(&self) -> DeliveryOutcome {
        let Some(_guard) = self.try_acquire() else {
            return DeliveryOutcome::Busy;
        };
        self.send_next().await
    }

    /// Page-exit drain: hand every queued envelope off without waiting.
    ///
    /// Each envelope goes to the transport's beacon primitive; when that is
    /// unavailable or refuses, it is posted as a detached keepalive request.
    /// Nothing is retried. Returns the number of envelopes handed off.
    pub fn flush_now(&self) -> usize {
        let batch: Vec<QueuedEnvelope> = self.inner.pending.lock().drain(..).collect();
        if batch.is_empty() {
            return 0;
        }

        let mut handed_off = 0;
        for item in batch {
            let Some(request) = self.request_for(&item.envelope, true) else {
                continue;
            };
            match self.inner.transport.send_beacon(&request) {
                Ok(()) => {
                    Counters::bump(&self.inner.counters.beacons, "beacon");
                    handed_off += 1;
                }
                Err(e) => {
                    debug!(error = %e, "beacon refused, falling back to keepalive post");
                    if self.post_detached(request) {
                        handed_off += 1;
                    }
                }
            }
        }
        info!(count = handed_off, "flushed queue on page exit");
        handed_off
    }

    // ── internals ───────────────────────────────────────────────────

    fn try_acquire(&self) -> Option<SendingGuard<'_>> {
        self.inner
            .sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SendingGuard { inner: &self.inner })
    }

    async fn send_until_idle(&self) {
        loop {
            match self.send_next().await {
                DeliveryOutcome::Idle => return,
                DeliveryOutcome::Requeued => self.pause_before_retry().await,
                _ => {}
            }
        }
    }

    async fn pause_before_retry(&self) {
        let failures = self.inner.consecutive_failures.load(Ordering::Relaxed);
        let delay = self.inner.retry.delay_for(failures, rand::random::<f64>());
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            debug!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                failures,
                "backing off before retry"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Send the front envelope. Caller holds the `sending` flag.
    async fn send_next(&self) -> DeliveryOutcome {
        let Some(mut item) = self.inner.pending.lock().pop_front() else {
            return DeliveryOutcome::Idle;
        };
        let Some(request) = self.request_for(&item.envelope, item.keepalive) else {
            return DeliveryOutcome::Dropped;
        };
        item.attempts += 1;

        match self.inner.transport.post(&request).await {
            Ok(response) if response.is_success() => {
                self.inner.consecutive_failures.store(0, Ordering::Relaxed);
                self.reconcile(&response);
                Counters::bump(&self.inner.counters.delivered, "delivered");
                debug!(event = %item.envelope.event.name, "envelope delivered");
                DeliveryOutcome::Delivered
            }
            Ok(response) => {
                self.inner.consecutive_failures.store(0, Ordering::Relaxed);
                Counters::bump(&self.inner.counters.rejected, "rejected");
                let error = PixelError::HttpStatus {
                    status: response.status,
                };
                warn!(
                    event = %item.envelope.event.name,
                    error = %error,
                    kind = error.error_kind(),
                    "envelope consumed without retry"
                );
                DeliveryOutcome::Rejected {
                    status: response.status,
                }
            }
            Err(e) if e.is_retryable() => {
                let failures = self.inner.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if self.inner.retry.is_exhausted(item.attempts) {
                    Counters::bump(&self.inner.counters.dropped, "dropped");
                    warn!(
                        event = %item.envelope.event.name,
                        attempts = item.attempts,
                        error = %e,
                        "retry budget exhausted, dropping envelope"
                    );
                    return DeliveryOutcome::Dropped;
                }
                debug!(
                    event = %item.envelope.event.name,
                    attempts = item.attempts,
                    failures,
                    error = %e,
                    "send failed, requeued at front"
                );
                self.inner.pending.lock().push_front(item);
                Counters::bump(&self.inner.counters.requeued, "requeued");
                DeliveryOutcome::Requeued
            }
            Err(e) => {
                Counters::bump(&self.inner.counters.dropped, "dropped");
                warn!(
                    event = %item.envelope.event.name,
                    error = %e,
                    kind = e.error_kind(),
                    "dropping envelope"
                );
                DeliveryOutcome::Dropped
            }
        }
    }

    fn request_for(&self, envelope: &Envelope, keepalive: bool) -> Option<CollectRequest> {
        match serde_json::to_string(envelope) {
            Ok(body) => Some(CollectRequest {
                url: self.inner.collect_url.clone(),
                body,
                keepalive,
            }),
            Err(e) => {
                Counters::bump(&self.inner.counters.dropped, "dropped");
                warn!(event = %envelope.event.name, error = %e, "envelope not serializable");
                None
            }
        }
    }

    /// Adopt server-assigned identifiers from a 2xx body.
    fn reconcile(&self, response: &CollectResponse) {
        let reconciliation = response.reconciliation();
        if let Some(id) = reconciliation.visitor_id.filter(|id| !id.is_empty()) {
            debug!(visitor_id = %id, "adopting server visitor id");
            self.inner.identity.override_visitor_id(VisitorId::from(id));
        }
        if let Some(id) = reconciliation.session_id.filter(|id| !id.is_empty()) {
            debug!(session_id = %id, "adopting server session id");
            self.inner.identity.override_session_id(SessionId::from(id));
        }
    }

    fn post_detached(&self, request: CollectRequest) -> bool {
        let Some(runtime) = &self.inner.runtime else {
            Counters::bump(&self.inner.counters.dropped, "dropped");
            debug!("no runtime for keepalive post, dropping envelope");
            return false;
        };
        let transport = Arc::clone(&self.inner.transport);
        let _ = runtime.spawn(async move {
            if let Err(e) = transport.post(&request).await {
                debug!(error = %e, "keepalive post failed");
            }
        });
        Counters::bump(&self.inner.counters.keepalive_fallbacks, "keepalive");
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
