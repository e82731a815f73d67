//! Envelope construction.
//!
//! [`PayloadBuilder::build_payload`] turns a verb call into an [`Envelope`]:
//! identity and session from the [`IdentityManager`], page and device from
//! the [`Environment`], event fields from the caller's properties and
//! [`TrackOptions`].

use std::sync::Arc;

use chrono::Utc;
use pixel_core::{
    DeviceInfo, DeviceType, Envelope, EventData, EventId, LineItem, PageInfo,
};
use serde_json::{Map, Value};
use url::Url;

use crate::environment::{DeviceContext, Environment, PageContext};
use crate::identity::IdentityManager;

/// Caller overrides for the page snapshot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PageOverrides {
    /// Replace the page URL.
    pub url: Option<String>,
    /// Replace the path.
    pub path: Option<String>,
    /// Replace the title.
    pub title: Option<String>,
    /// Replace the referrer.
    pub referrer: Option<String>,
    /// Search term for this page.
    pub search_term: Option<String>,
    /// Extra page fields.
    pub extra: Map<String, Value>,
}

/// Per-call options for a tracking verb.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackOptions {
    /// Monetary value.
    pub value: Option<f64>,
    /// Currency for `value`.
    pub currency: Option<String>,
    /// Order reference.
    pub order_id: Option<String>,
    /// Subscription reference.
    pub subscription_id: Option<String>,
    /// Count as a conversion. An `isConversion` property that is `true`, a
    /// non-zero number, or `"true"`/`"1"`/`"yes"` has the same effect.
    pub is_conversion: bool,
    /// Line items. When absent, an `items` array property is converted
    /// with [`LineItem::from_value`].
    pub items: Option<Vec<LineItem>>,
    /// Correlation ID.
    pub event_id: Option<EventId>,
    /// Page snapshot overrides.
    pub page: Option<PageOverrides>,
    /// Ask the transport to let the request outlive the page.
    pub keepalive: bool,
}

/// Builds envelopes from tracker state and the host environment.
pub struct PayloadBuilder {
    identity: Arc<IdentityManager>,
    environment: Arc<dyn Environment>,
}

impl PayloadBuilder {
    /// Create a builder.
    pub fn new(identity: Arc<IdentityManager>, environment: Arc<dyn Environment>) -> Self {
        Self {
            identity,
            environment,
        }
    }

    /// Assemble the envelope for one event.
    ///
    /// Ensures visitor and session IDs (which may create them and always
    /// refreshes session activity).
    pub fn build_payload(
        &self,
        event_name: &str,
        properties: Map<String, Value>,
        options: &TrackOptions,
    ) -> Envelope {
        let visitor_id = self.identity.ensure_visitor_id();
        let session_id = self.identity.ensure_session_id();

        let page = build_page(&self.environment.page(), options.page.as_ref());
        let device = build_device(self.environment.device());
        let search_term = derive_search_term(&properties, options.page.as_ref(), &page.url);

        let event = EventData {
            name: event_name.to_string(),
            timestamp: Utc::now(),
            value: options.value.or_else(|| number_property(&properties, "value")),
            currency: options
                .currency
                .clone()
                .or_else(|| string_property(&properties, "currency")),
            order_id: options
                .order_id
                .clone()
                .or_else(|| string_property(&properties, "orderId")),
            subscription_id: options
                .subscription_id
                .clone()
                .or_else(|| string_property(&properties, "subscriptionId")),
            search_term,
            is_conversion: options.is_conversion || truthy_property(&properties, "isConversion"),
            items: options.items.clone().or_else(|| items_property(&properties)),
            event_id: options.event_id.clone(),
            properties,
        };

        Envelope {
            visitor_id,
            session_id,
            event,
            page,
            device,
            utm: self.identity.utm(),
        }
    }
}

/// Classify a user agent as mobile, tablet or desktop by substring match.
pub fn classify_device(user_agent: &str) -> DeviceType {
    let ua = user_agent.to_lowercase();
    let is_tablet = ["ipad", "tablet", "playbook", "silk", "kindle"]
        .iter()
        .any(|needle| ua.contains(needle))
        || (ua.contains("android") && !ua.contains("mobile"));
    if is_tablet {
        return DeviceType::Tablet;
    }
    if ["mobi", "iphone", "ipod", "android", "blackberry", "opera mini", "iemobile"]
        .iter()
        .any(|needle| ua.contains(needle))
    {
        return DeviceType::Mobile;
    }
    DeviceType::Desktop
}

/// Search term: explicit property, then page override, then `search`/`q` in the URL.
pub fn derive_search_term(
    properties: &Map<String, Value>,
    page: Option<&PageOverrides>,
    url: &str,
) -> Option<String> {
    if let Some(term) = string_property(properties, "searchTerm") {
        return Some(term);
    }
    if let Some(term) = page.and_then(|p| p.search_term.clone()).filter(|t| !t.is_empty()) {
        return Some(term);
    }
    let url = Url::parse(url).ok()?;
    ["search", "q"].iter().find_map(|key| {
        url.query_pairs()
            .find(|(k, v)| k == key && !v.is_empty())
            .map(|(_, v)| v.into_owned())
    })
}

fn build_page(context: &PageContext, overrides: Option<&PageOverrides>) -> PageInfo {
    let url = overrides
        .and_then(|o| o.url.clone())
        .unwrap_or_else(|| context.url.clone());
    let path = overrides.and_then(|o| o.path.clone()).unwrap_or_else(|| {
        Url::parse(&url).map_or_else(|_| String::new(), |u| u.path().to_string())
    });

    PageInfo {
        path,
        title: overrides
            .and_then(|o| o.title.clone())
            .or_else(|| context.title.clone()),
        referrer: overrides
            .and_then(|o| o.referrer.clone())
            .or_else(|| context.referrer.clone())
            .filter(|r| !r.is_empty()),
        search_term: overrides.and_then(|o| o.search_term.clone()),
        extra: overrides.map(|o| o.extra.clone()).unwrap_or_default(),
        url,
    }
}

fn build_device(context: DeviceContext) -> DeviceInfo {
    let reports_mobile = context.user_agent_data.as_ref().is_some_and(|data| data.mobile);
    let device_type = match classify_device(&context.user_agent) {
        DeviceType::Desktop if reports_mobile => DeviceType::Mobile,
        classified => classified,
    };
    let (browser, os) = context
        .user_agent_data
        .as_ref()
        .map_or((None, None), |data| (data.browser(), data.platform.clone()));

    DeviceInfo {
        user_agent: context.user_agent,
        language: context.language,
        device_type,
        vendor: context.vendor,
        platform: context.platform,
        screen_width: context.screen_width,
        screen_height: context.screen_height,
        color_depth: context.color_depth,
        timezone: context.timezone,
        browser,
        os,
    }
}

fn string_property(properties: &Map<String, Value>, key: &str) -> Option<String> {
    match properties.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number_property(properties: &Map<String, Value>, key: &str) -> Option<f64> {
    match properties.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn items_property(properties: &Map<String, Value>) -> Option<Vec<LineItem>> {
    let items = properties.get("items")?.as_array()?;
    Some(items.iter().filter_map(LineItem::from_value).collect())
}

/// `true`, non-zero numbers and the strings `"true"`/`"1"`/`"yes"`.
fn truthy_property(properties: &Map<String, Value>, key: &str) -> bool {
    match properties.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(s)) => {
            matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
        }
        _ => false,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::environment::{StaticEnvironment, UserAgentData};
    use crate::storage::{BestEffortStorage, MemoryStorage, StorageScope};

    const IPHONE: &str =
        "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 Mobile/15E148";
    const IPAD: &str = "Mozilla/5.0 (iPad; CPU OS 16_0 like Mac OS X) AppleWebKit/605.1.15";
    const ANDROID_PHONE: &str =
        "Mozilla/5.0 (Linux; Android 14; Pixel 8) Chrome/120.0 Mobile Safari/537.36";
    const ANDROID_TABLET: &str =
        "Mozilla/5.0 (Linux; Android 13; SM-X700) Chrome/120.0 Safari/537.36";
    const MAC: &str =
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_0) AppleWebKit/605.1.15 Safari/605.1.15";

    fn props(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn builder(url: &str, device: DeviceContext) -> PayloadBuilder {
        let identity = IdentityManager::load(
            BestEffortStorage::new(Arc::new(MemoryStorage::new()), StorageScope::Durable),
            BestEffortStorage::new(Arc::new(MemoryStorage::new()), StorageScope::Session),
            Duration::from_secs(1800),
        );
        let env = StaticEnvironment::new(url, device)
            .with_title("Shoes")
            .with_referrer("https://google.test/");
        PayloadBuilder::new(Arc::new(identity), Arc::new(env))
    }

    #[test]
    fn classifies_devices() {
        assert_eq!(classify_device(IPHONE), DeviceType::Mobile);
        assert_eq!(classify_device(ANDROID_PHONE), DeviceType::Mobile);
        assert_eq!(classify_device(IPAD), DeviceType::Tablet);
        assert_eq!(classify_device(ANDROID_TABLET), DeviceType::Tablet);
        assert_eq!(classify_device(MAC), DeviceType::Desktop);
        assert_eq!(classify_device(""), DeviceType::Desktop);
    }

    #[test]
    fn envelope_carries_ids_page_and_device() {
        let b = builder(
            "https://shop.test/shoes?color=red",
            DeviceContext {
                user_agent: IPHONE.into(),
                language: Some("nb-NO".into()),
                timezone: Some("Europe/Oslo".into()),
                ..Default::default()
            },
        );
        let envelope = b.build_payload("ViewContent", Map::new(), &TrackOptions::default());

        assert!(!envelope.visitor_id.is_empty());
        assert!(!envelope.session_id.is_empty());
        assert_eq!(envelope.event.name, "ViewContent");
        assert_eq!(envelope.page.url, "https://shop.test/shoes?color=red");
        assert_eq!(envelope.page.path, "/shoes");
        assert_eq!(envelope.page.title.as_deref(), Some("Shoes"));
        assert_eq!(envelope.page.referrer.as_deref(), Some("https://google.test/"));
        assert_eq!(envelope.device.device_type, DeviceType::Mobile);
        assert_eq!(envelope.device.timezone.as_deref(), Some("Europe/Oslo"));
        assert_eq!(envelope.device.browser, None);
    }

    #[test]
    fn repeated_builds_share_identity() {
        let b = builder("https://shop.test/", DeviceContext::default());
        let a = b.build_payload("A", Map::new(), &TrackOptions::default());
        let c = b.build_payload("B", Map::new(), &TrackOptions::default());
        assert_eq!(a.visitor_id, c.visitor_id);
        assert_eq!(a.session_id, c.session_id);
    }

    #[test]
    fn user_agent_data_fills_browser_and_os() {
        let b = builder(
            "https://shop.test/",
            DeviceContext {
                user_agent: MAC.into(),
                user_agent_data: Some(UserAgentData {
                    brands: vec!["Not_A Brand".into(), "Chromium".into()],
                    platform: Some("macOS".into()),
                    mobile: false,
                }),
                ..Default::default()
            },
        );
        let envelope = b.build_payload("X", Map::new(), &TrackOptions::default());
        assert_eq!(envelope.device.browser.as_deref(), Some("Chromium"));
        assert_eq!(envelope.device.os.as_deref(), Some("macOS"));
    }

    #[test]
    fn user_agent_data_mobile_hint_upgrades_desktop() {
        let hinted = |user_agent: &str| DeviceContext {
            user_agent: user_agent.into(),
            user_agent_data: Some(UserAgentData {
                brands: vec!["Chromium".into()],
                platform: Some("Android".into()),
                mobile: true,
            }),
            ..Default::default()
        };
        let reduced_ua = "Mozilla/5.0 (X11; Linux x86_64) Chrome/126.0 Safari/537.36";
        let envelope = builder("https://shop.test/", hinted(reduced_ua)).build_payload(
            "X",
            Map::new(),
            &TrackOptions::default(),
        );
        assert_eq!(envelope.device.device_type, DeviceType::Mobile);

        let envelope = builder("https://shop.test/", hinted(IPAD)).build_payload(
            "X",
            Map::new(),
            &TrackOptions::default(),
        );
        assert_eq!(envelope.device.device_type, DeviceType::Tablet);
    }

    #[test]
    fn search_term_priority() {
        let overrides = PageOverrides {
            search_term: Some("from-page".into()),
            ..Default::default()
        };
        let url = "https://shop.test/s?search=from-search&q=from-q";

        let explicit = props(json!({"searchTerm": "explicit"}));
        assert_eq!(
            derive_search_term(&explicit, Some(&overrides), url).as_deref(),
            Some("explicit")
        );
        assert_eq!(
            derive_search_term(&Map::new(), Some(&overrides), url).as_deref(),
            Some("from-page")
        );
        assert_eq!(
            derive_search_term(&Map::new(), None, url).as_deref(),
            Some("from-search")
        );
        assert_eq!(
            derive_search_term(&Map::new(), None, "https://shop.test/s?q=boots").as_deref(),
            Some("boots")
        );
        assert_eq!(derive_search_term(&Map::new(), None, "https://shop.test/"), None);
    }

    #[test]
    fn conversion_flag_is_or_of_option_and_property() {
        let b = builder("https://shop.test/", DeviceContext::default());
        let by_prop = b.build_payload(
            "Lead",
            props(json!({"isConversion": true})),
            &TrackOptions::default(),
        );
        assert!(by_prop.event.is_conversion);

        let by_option = b.build_payload(
            "Lead",
            Map::new(),
            &TrackOptions {
                is_conversion: true,
                ..Default::default()
            },
        );
        assert!(by_option.event.is_conversion);

        let neither = b.build_payload(
            "Lead",
            props(json!({"isConversion": false})),
            &TrackOptions::default(),
        );
        assert!(!neither.event.is_conversion);
    }

    #[test]
    fn conversion_property_accepts_truthy_forms() {
        let b = builder("https://shop.test/", DeviceContext::default());
        for flag in [json!(1), json!("true"), json!("YES"), json!(2.5)] {
            let envelope = b.build_payload(
                "Lead",
                props(json!({"isConversion": flag})),
                &TrackOptions::default(),
            );
            assert!(envelope.event.is_conversion, "{flag} should count");
        }
        for flag in [json!(0), json!("false"), json!(""), json!(null), json!([true])] {
            let envelope = b.build_payload(
                "Lead",
                props(json!({"isConversion": flag})),
                &TrackOptions::default(),
            );
            assert!(!envelope.event.is_conversion, "{flag} should not count");
        }
    }

    #[test]
    fn commerce_fields_from_options_then_properties() {
        let b = builder("https://shop.test/", DeviceContext::default());
        let envelope = b.build_payload(
            "Purchase",
            props(json!({
                "value": "49.90",
                "currency": "NOK",
                "orderId": 1001,
                "items": [{"id": "sku-1", "price": 49.9, "quantity": 1}]
            })),
            &TrackOptions {
                currency: Some("EUR".into()),
                ..Default::default()
            },
        );
        assert_eq!(envelope.event.value, Some(49.9));
        assert_eq!(envelope.event.currency.as_deref(), Some("EUR"));
        assert_eq!(envelope.event.order_id.as_deref(), Some("1001"));
        let items = envelope.event.items.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id.as_deref(), Some("sku-1"));
    }

    #[test]
    fn mixed_type_items_are_all_kept() {
        let b = builder("https://shop.test/", DeviceContext::default());
        let envelope = b.build_payload(
            "Purchase",
            props(json!({
                "items": [
                    {"id": 8_812_345, "price": 80, "quantity": 1},
                    {"id": "sku-2", "price": "19.99", "quantity": 2},
                    {"id": "sku-3", "quantity": 1.5},
                    {"sku": ["a", "b"], "price": "n/a"}
                ]
            })),
            &TrackOptions::default(),
        );

        let items = envelope.event.items.unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[0].id.as_deref(), Some("8812345"));
        assert_eq!(items[1].price, Some(19.99));
        assert_eq!(items[2].quantity.as_ref().and_then(|q| q.as_f64()), Some(1.5));
        assert_eq!(items[3].extra["price"], "n/a");
        assert_eq!(items[3].extra["sku"], json!(["a", "b"]));
    }

    #[test]
    fn page_overrides_apply() {
        let b = builder("https://shop.test/real", DeviceContext::default());
        let mut extra = Map::new();
        let _ = extra.insert("template".into(), json!("product"));
        let envelope = b.build_payload(
            "PageView",
            Map::new(),
            &TrackOptions {
                page: Some(PageOverrides {
                    url: Some("https://shop.test/virtual/step-2".into()),
                    title: Some("Step 2".into()),
                    extra,
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        assert_eq!(envelope.page.url, "https://shop.test/virtual/step-2");
        assert_eq!(envelope.page.path, "/virtual/step-2");
        assert_eq!(envelope.page.title.as_deref(), Some("Step 2"));
        assert_eq!(envelope.page.extra["template"], "product");
    }
}
