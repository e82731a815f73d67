//! The event envelope posted to the collection endpoint.
//!
//! One [`Envelope`] per tracked action. All field names are camelCase on the
//! wire and absent optionals are omitted entirely, so the server sees the
//! same shape regardless of which verb produced the event.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Number, Value};

use crate::ids::{EventId, SessionId, VisitorId};
use crate::utm::UtmParams;

/// Full payload for a single tracked event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Durable visitor identifier.
    pub visitor_id: VisitorId,
    /// Current session identifier.
    pub session_id: SessionId,
    /// The tracked event itself.
    pub event: EventData,
    /// Page snapshot at the time of the event.
    pub page: PageInfo,
    /// Device snapshot at the time of the event.
    pub device: DeviceInfo,
    /// Campaign attribution captured for this visitor, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utm: Option<UtmParams>,
}

/// Event body inside an [`Envelope`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    /// Event name (`PageView`, `Contact`, `AddToCart`, ...).
    pub name: String,
    /// Caller-supplied properties.
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// When the event was built.
    pub timestamp: DateTime<Utc>,
    /// Monetary value attached to the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// ISO currency code for `value`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    /// Commerce order reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    /// Subscription reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    /// Search query associated with the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_term: Option<String>,
    /// Whether the server should count this event as a conversion.
    pub is_conversion: bool,
    /// Line items (cart contents, order lines).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<LineItem>>,
    /// Correlation ID, present for page views and when supplied by the caller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
}

/// A commerce line item.
///
/// Hosts send line items in whatever shape their platform uses, so the known
/// fields accept loose JSON: `id` may be a string or a number, `price` a
/// number or a numeric string, `quantity` any number. Use
/// [`LineItem::from_value`] to convert host data without losing items.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    /// Product or variant identifier.
    #[serde(default, deserialize_with = "string_or_number")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Display name.
    #[serde(default, deserialize_with = "string_or_number")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Unit price.
    #[serde(default, deserialize_with = "numeric")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    /// Quantity, kept as sent (`2`, `1.5`).
    #[serde(default, deserialize_with = "quantity")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<Number>,
    /// Any other fields the host attached.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LineItem {
    /// Convert one host-supplied item.
    ///
    /// Objects whose known fields cannot be read are kept verbatim in
    /// `extra`; a bare string or number becomes the `id`. Returns `None`
    /// only for values that carry nothing (`null`, booleans, arrays).
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(
                serde_json::from_value(value.clone()).unwrap_or_else(|_| Self {
                    extra: map.clone(),
                    ..Self::default()
                }),
            ),
            Value::String(id) => Some(Self {
                id: Some(id.clone()),
                ..Self::default()
            }),
            Value::Number(id) => Some(Self {
                id: Some(id.to_string()),
                ..Self::default()
            }),
            _ => None,
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(D::Error::custom(format!("expected string or number, got {other}"))),
    }
}

fn numeric<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("not a number: {s}"))),
        Some(other) => Err(D::Error::custom(format!("expected number, got {other}"))),
    }
}

fn quantity<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Number>, D::Error> {
    match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(Some(n)),
        Some(Value::String(s)) => {
            let s = s.trim();
            s.parse::<u64>()
                .ok()
                .map(Number::from)
                .or_else(|| s.parse::<f64>().ok().and_then(Number::from_f64))
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("not a quantity: {s}")))
        }
        Some(other) => Err(D::Error::custom(format!("expected number, got {other}"))),
    }
}

/// Page snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    /// Full page URL.
    pub url: String,
    /// URL path component.
    pub path: String,
    /// Document title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Referrer URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    /// Search term override supplied by the caller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_term: Option<String>,
    /// Additional caller overrides.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Coarse device classification derived from the user agent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Phones and other handhelds.
    Mobile,
    /// Tablets.
    Tablet,
    /// Anything else.
    #[default]
    Desktop,
}

/// Device snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Raw user agent string.
    pub user_agent: String,
    /// Preferred language tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Coarse device class.
    pub device_type: DeviceType,
    /// Browser vendor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    /// Platform string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Screen width in CSS pixels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_width: Option<u32>,
    /// Screen height in CSS pixels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_height: Option<u32>,
    /// Colour depth in bits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_depth: Option<u32>,
    /// IANA timezone name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Browser brand, when the environment exposes user-agent data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    /// Operating system, when the environment exposes user-agent data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
