//! Test doubles shared by the delivery and tracker tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use pixel_core::{
    DeviceInfo, Envelope, EventData, PageInfo, PixelError, Result, SessionId, VisitorId,
};
use serde_json::Map;

use crate::transport::{CollectRequest, CollectResponse, Transport};

/// Transport that replays a script of results and records every call.
///
/// Once the script runs out every post answers `200 {}`.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Result<CollectResponse>>>,
    posts: Mutex<Vec<CollectRequest>>,
    beacons: Mutex<Vec<CollectRequest>>,
    beacon_available: bool,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_beacon(mut self) -> Self {
        self.beacon_available = true;
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn then_ok(self, body: &str) -> Self {
        self.script.lock().push_back(Ok(CollectResponse {
            status: 200,
            body: body.to_string(),
        }));
        self
    }

    pub(crate) fn then_status(self, status: u16) -> Self {
        self.script.lock().push_back(Ok(CollectResponse {
            status,
            body: String::new(),
        }));
        self
    }

    pub(crate) fn then_network_error(self) -> Self {
        self.script
            .lock()
            .push_back(Err(PixelError::Network("connection refused".into())));
        self
    }

    pub(crate) fn posts(&self) -> Vec<CollectRequest> {
        self.posts.lock().clone()
    }

    pub(crate) fn beacons(&self) -> Vec<CollectRequest> {
        self.beacons.lock().clone()
    }

    /// Event names of every post, in call order.
    pub(crate) fn posted_names(&self) -> Vec<String> {
        self.posts.lock().iter().map(event_name).collect()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post(&self, request: &CollectRequest) -> Result<CollectResponse> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.posts.lock().push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.script.lock().pop_front();
        let _ = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        next.unwrap_or_else(|| {
            Ok(CollectResponse {
                status: 200,
                body: "{}".into(),
            })
        })
    }

    fn send_beacon(&self, request: &CollectRequest) -> Result<()> {
        if !self.beacon_available {
            return Err(PixelError::BeaconUnavailable);
        }
        self.beacons.lock().push(request.clone());
        Ok(())
    }
}

/// Event name carried in a posted body.
pub(crate) fn event_name(request: &CollectRequest) -> String {
    let envelope: Envelope = serde_json::from_str(&request.body).unwrap();
    envelope.event.name
}

/// Minimal envelope for queue tests.
pub(crate) fn envelope(name: &str) -> Envelope {
    Envelope {
        visitor_id: VisitorId::from("v-test"),
        session_id: SessionId::from("s-test"),
        event: EventData {
            name: name.to_string(),
            properties: Map::new(),
            timestamp: Utc::now(),
            value: None,
            currency: None,
            order_id: None,
            subscription_id: None,
            search_term: None,
            is_conversion: false,
            items: None,
            event_id: None,
        },
        page: PageInfo {
            url: "https://shop.test/".into(),
            path: "/".into(),
            ..Default::default()
        },
        device: DeviceInfo::default(),
        utm: None,
    }
}
