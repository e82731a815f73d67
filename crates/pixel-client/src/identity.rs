//! Visitor identity, session window, traits and campaign attribution.
//!
//! [`IdentityManager`] owns the in-memory copy of everything the tracker
//! remembers about the visitor and mirrors it into storage on each change.
//! Storage is best effort: reads happen once at construction, writes may
//! silently fail, and the in-memory copy stays authoritative for the
//! lifetime of the manager.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pixel_core::{Identity, IdentityTraits, SessionId, UtmParams, VisitorId};
use serde::Serialize;
use tracing::{debug, info};

use crate::storage::BestEffortStorage;

/// Storage keys.
pub mod keys {
    /// Durable: visitor ID.
    pub const VISITOR_ID: &str = "pixel_visitor_id";
    /// Durable: identity traits (JSON).
    pub const IDENTITY: &str = "pixel_identity";
    /// Durable: UTM parameters (JSON).
    pub const UTM: &str = "pixel_utm";
    /// Session: session ID.
    pub const SESSION_ID: &str = "pixel_session_id";
    /// Session: last activity (RFC 3339).
    pub const LAST_ACTIVITY: &str = "pixel_last_activity";
}

/// Parse UTM parameters from a URL.
///
/// `None` when the URL carries no UTM-like parameter.
pub fn parse_utm(url: &str) -> Option<UtmParams> {
    UtmParams::from_url(url)
}

/// Read-only view of identity state for host-page introspection.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySnapshot {
    /// Durable visitor ID, once ensured.
    pub visitor_id: Option<VisitorId>,
    /// Current session ID, once ensured.
    pub session_id: Option<SessionId>,
    /// Captured campaign attribution.
    pub utm: Option<UtmParams>,
    /// Accumulated identity traits.
    pub identity: Identity,
}

#[derive(Debug, Default)]
struct IdentityState {
    visitor_id: Option<VisitorId>,
    session_id: Option<SessionId>,
    last_activity: Option<DateTime<Utc>>,
    utm: Option<UtmParams>,
    identity: Identity,
}

/// Owner of visitor/session identity and its persistence.
#[derive(Debug)]
pub struct IdentityManager {
    durable: BestEffortStorage,
    session: BestEffortStorage,
    session_timeout: Duration,
    state: Mutex<IdentityState>,
}

impl IdentityManager {
    /// Load persisted state from both scopes.
    pub fn load(
        durable: BestEffortStorage,
        session: BestEffortStorage,
        session_timeout: Duration,
    ) -> Self {
        let last_activity = session
            .get(keys::LAST_ACTIVITY)
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|ts| ts.with_timezone(&Utc));

        let state = IdentityState {
            visitor_id: durable
                .get(keys::VISITOR_ID)
                .filter(|v| !v.is_empty())
                .map(VisitorId::from),
            session_id: session
                .get(keys::SESSION_ID)
                .filter(|v| !v.is_empty())
                .map(SessionId::from),
            last_activity,
            utm: durable.get_json(keys::UTM),
            identity: durable.get_json(keys::IDENTITY).unwrap_or_default(),
        };
        debug!(
            has_visitor = state.visitor_id.is_some(),
            has_session = state.session_id.is_some(),
            "identity state loaded"
        );

        Self {
            durable,
            session,
            session_timeout,
            state: Mutex::new(state),
        }
    }

    /// Existing visitor ID, or a freshly generated and persisted one.
    pub fn ensure_visitor_id(&self) -> VisitorId {
        let mut state = self.state.lock();
        if let Some(id) = &state.visitor_id {
            return id.clone();
        }
        let id = VisitorId::new();
        let _ = self.durable.set(keys::VISITOR_ID, id.as_str());
        info!(visitor_id = %id, "new visitor");
        state.visitor_id = Some(id.clone());
        id
    }

    /// Current session ID, rotated after inactivity, using the wall clock.
    pub fn ensure_session_id(&self) -> SessionId {
        self.ensure_session_id_at(Utc::now())
    }

    /// Current session ID as of `now`.
    ///
    /// A new session starts when there is no session, no recorded activity,
    /// or more than the timeout has elapsed since the last activity. The
    /// activity timestamp is refreshed on every call.
    pub fn ensure_session_id_at(&self, now: DateTime<Utc>) -> SessionId {
        let mut state = self.state.lock();

        let expired = match (&state.session_id, state.last_activity) {
            (Some(_), Some(last)) => (now - last)
                .to_std()
                .is_ok_and(|elapsed| elapsed > self.session_timeout),
            _ => true,
        };

        let id = match (&state.session_id, expired) {
            (Some(id), false) => id.clone(),
            _ => {
                let id = SessionId::new();
                let _ = self.session.set(keys::SESSION_ID, id.as_str());
                debug!(session_id = %id, "session started");
                state.session_id = Some(id.clone());
                id
            }
        };

        state.last_activity = Some(now);
        let _ = self.session.set(keys::LAST_ACTIVITY, &now.to_rfc3339());
        id
    }

    /// Merge `traits` into the stored identity and persist the result.
    pub fn persist_identity(&self, traits: IdentityTraits) -> Identity {
        let mut state = self.state.lock();
        state.identity.merge(traits);
        let _ = self.durable.set_json(keys::IDENTITY, &state.identity);
        state.identity.clone()
    }

    /// Campaign attribution: the cached value, or whatever `url` carries.
    ///
    /// Once captured, later calls return the cached value without looking
    /// at the URL again until [`clear_utm`](Self::clear_utm).
    pub fn persist_utm(&self, url: &str) -> Option<UtmParams> {
        let mut state = self.state.lock();
        if state.utm.is_some() {
            return state.utm.clone();
        }
        let utm = parse_utm(url)?;
        let _ = self.durable.set_json(keys::UTM, &utm);
        debug!(source = utm.source.as_deref(), campaign = utm.campaign.as_deref(), "utm captured");
        state.utm = Some(utm.clone());
        Some(utm)
    }

    /// Forget identity traits.
    pub fn clear_identity(&self) {
        self.state.lock().identity = Identity::default();
        let _ = self.durable.remove(keys::IDENTITY);
    }

    /// Forget campaign attribution.
    pub fn clear_utm(&self) {
        self.state.lock().utm = None;
        let _ = self.durable.remove(keys::UTM);
    }

    /// Replace the visitor ID with a server-assigned one.
    pub fn override_visitor_id(&self, id: VisitorId) {
        if id.is_empty() {
            return;
        }
        let _ = self.durable.set(keys::VISITOR_ID, id.as_str());
        self.state.lock().visitor_id = Some(id);
    }

    /// Replace the session ID with a server-assigned one.
    pub fn override_session_id(&self, id: SessionId) {
        if id.is_empty() {
            return;
        }
        let _ = self.session.set(keys::SESSION_ID, id.as_str());
        self.state.lock().session_id = Some(id);
    }

    /// Current UTM parameters, if captured.
    pub fn utm(&self) -> Option<UtmParams> {
        self.state.lock().utm.clone()
    }

    /// Read-only copy of the current state.
    pub fn snapshot(&self) -> IdentitySnapshot {
        let state = self.state.lock();
        IdentitySnapshot {
            visitor_id: state.visitor_id.clone(),
            session_id: state.session_id.clone(),
            utm: state.utm.clone(),
            identity: state.identity.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeDelta;
    use serde_json::json;

    use super::*;
    use crate::storage::tests::UnavailableStorage;
    use crate::storage::{MemoryStorage, Storage, StorageScope};

    const THIRTY_MINUTES: Duration = Duration::from_secs(30 * 60);

    fn stores() -> (Arc<MemoryStorage>, Arc<MemoryStorage>) {
        (Arc::new(MemoryStorage::new()), Arc::new(MemoryStorage::new()))
    }

    fn manager(durable: &Arc<MemoryStorage>, session: &Arc<MemoryStorage>) -> IdentityManager {
        IdentityManager::load(
            BestEffortStorage::new(durable.clone(), StorageScope::Durable),
            BestEffortStorage::new(session.clone(), StorageScope::Session),
            THIRTY_MINUTES,
        )
    }

    fn trait_map(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        match value {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    // ── visitor ─────────────────────────────────────────────────────

    #[test]
    fn visitor_id_is_created_once() {
        let (durable, session) = stores();
        let ids = manager(&durable, &session);
        let first = ids.ensure_visitor_id();
        let second = ids.ensure_visitor_id();
        assert_eq!(first, second);
        assert_eq!(durable.get(keys::VISITOR_ID).unwrap().as_deref(), Some(first.as_str()));
    }

    #[test]
    fn visitor_id_survives_reload() {
        let (durable, session) = stores();
        let first = manager(&durable, &session).ensure_visitor_id();
        let reloaded = manager(&durable, &Arc::new(MemoryStorage::new()));
        assert_eq!(reloaded.ensure_visitor_id(), first);
    }

    // ── session ─────────────────────────────────────────────────────

    #[test]
    fn session_is_stable_within_timeout() {
        let (durable, session) = stores();
        let ids = manager(&durable, &session);
        let t0 = Utc::now();
        let a = ids.ensure_session_id_at(t0);
        let b = ids.ensure_session_id_at(t0 + TimeDelta::minutes(29));
        assert_eq!(a, b);
    }

    #[test]
    fn activity_keeps_session_rolling() {
        let (durable, session) = stores();
        let ids = manager(&durable, &session);
        let t0 = Utc::now();
        let a = ids.ensure_session_id_at(t0);
        let _ = ids.ensure_session_id_at(t0 + TimeDelta::minutes(20));
        let c = ids.ensure_session_id_at(t0 + TimeDelta::minutes(45));
        assert_eq!(a, c);
    }

    #[test]
    fn session_rotates_after_timeout() {
        let (durable, session) = stores();
        let ids = manager(&durable, &session);
        let t0 = Utc::now();
        let a = ids.ensure_session_id_at(t0);
        let b = ids.ensure_session_id_at(t0 + TimeDelta::minutes(31));
        assert_ne!(a, b);
        assert_eq!(session.get(keys::SESSION_ID).unwrap().as_deref(), Some(b.as_str()));
    }

    #[test]
    fn session_without_activity_timestamp_rotates() {
        let (durable, session) = stores();
        session.set(keys::SESSION_ID, "stale").unwrap();
        let ids = manager(&durable, &session);
        let id = ids.ensure_session_id();
        assert_ne!(id.as_str(), "stale");
        assert!(session.get(keys::LAST_ACTIVITY).unwrap().is_some());
    }

    #[test]
    fn session_resumes_from_storage() {
        let (durable, session) = stores();
        let now = Utc::now();
        session.set(keys::SESSION_ID, "s-existing").unwrap();
        session
            .set(keys::LAST_ACTIVITY, &(now - TimeDelta::minutes(5)).to_rfc3339())
            .unwrap();
        let ids = manager(&durable, &session);
        assert_eq!(ids.ensure_session_id_at(now).as_str(), "s-existing");
    }

    // ── identity ────────────────────────────────────────────────────

    #[test]
    fn identify_merges_traits_across_calls() {
        let (durable, session) = stores();
        let ids = manager(&durable, &session);
        let _ = ids.persist_identity(IdentityTraits {
            email: Some("a@b.test".into()),
            traits: Some(trait_map(json!({"foo": 1}))),
            ..Default::default()
        });
        let merged = ids.persist_identity(IdentityTraits {
            traits: Some(trait_map(json!({"bar": 2}))),
            ..Default::default()
        });

        assert_eq!(merged.email.as_deref(), Some("a@b.test"));
        assert_eq!(merged.traits["foo"], 1);
        assert_eq!(merged.traits["bar"], 2);

        let stored: Identity =
            serde_json::from_str(&durable.get(keys::IDENTITY).unwrap().unwrap()).unwrap();
        assert_eq!(stored, merged);
    }

    #[test]
    fn clear_identity_removes_traits() {
        let (durable, session) = stores();
        let ids = manager(&durable, &session);
        let _ = ids.persist_identity(IdentityTraits {
            email: Some("a@b.test".into()),
            ..Default::default()
        });
        ids.clear_identity();
        assert!(ids.snapshot().identity.is_empty());
        assert_eq!(durable.get(keys::IDENTITY).unwrap(), None);
    }

    // ── utm ─────────────────────────────────────────────────────────

    #[test]
    fn utm_is_captured_once() {
        let (durable, session) = stores();
        let ids = manager(&durable, &session);
        let first = ids.persist_utm("https://shop.test/?utm_source=newsletter").unwrap();
        let second = ids.persist_utm("https://shop.test/?utm_source=ads").unwrap();
        assert_eq!(first.source.as_deref(), Some("newsletter"));
        assert_eq!(second, first);
    }

    #[test]
    fn utm_recaptured_after_clear() {
        let (durable, session) = stores();
        let ids = manager(&durable, &session);
        let _ = ids.persist_utm("https://shop.test/?utm_source=newsletter");
        ids.clear_utm();
        let next = ids.persist_utm("https://shop.test/?utm_source=ads").unwrap();
        assert_eq!(next.source.as_deref(), Some("ads"));
    }

    #[test]
    fn url_without_utm_persists_nothing() {
        let (durable, session) = stores();
        let ids = manager(&durable, &session);
        assert_eq!(ids.persist_utm("https://shop.test/"), None);
        assert_eq!(durable.get(keys::UTM).unwrap(), None);
    }

    // ── reconciliation & degradation ────────────────────────────────

    #[test]
    fn server_ids_override_local_ones() {
        let (durable, session) = stores();
        let ids = manager(&durable, &session);
        let _ = ids.ensure_visitor_id();
        ids.override_visitor_id(VisitorId::from("srv-v"));
        ids.override_session_id(SessionId::from("srv-s"));
        assert_eq!(ids.ensure_visitor_id().as_str(), "srv-v");
        assert_eq!(durable.get(keys::VISITOR_ID).unwrap().as_deref(), Some("srv-v"));
        assert_eq!(session.get(keys::SESSION_ID).unwrap().as_deref(), Some("srv-s"));
    }

    #[test]
    fn unavailable_storage_degrades_to_memory() {
        let broken: Arc<dyn Storage> = Arc::new(UnavailableStorage);
        let ids = IdentityManager::load(
            BestEffortStorage::new(broken.clone(), StorageScope::Durable),
            BestEffortStorage::new(broken, StorageScope::Session),
            THIRTY_MINUTES,
        );
        let visitor = ids.ensure_visitor_id();
        let session = ids.ensure_session_id();
        assert!(!visitor.is_empty());
        assert_eq!(ids.ensure_visitor_id(), visitor);
        assert_eq!(ids.ensure_session_id(), session);
    }
}
