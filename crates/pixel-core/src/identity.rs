//! Visitor identity traits.
//!
//! Traits accumulate across `identify` calls: the named fields merge
//! shallowly (a later `None` keeps the earlier value) and the free-form
//! `traits` map merges deeply. Nothing is ever removed by a merge.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::json::deep_merge;

/// Accumulated identity of the current visitor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Email address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Phone number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Given name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    /// Family name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    /// Arbitrary trait map.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub traits: Map<String, Value>,
}

/// An incremental identity update, as passed to `identify`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityTraits {
    /// Email address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Phone number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Given name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    /// Family name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    /// Nested traits to deep-merge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traits: Option<Map<String, Value>>,
}

impl Identity {
    /// Fold an update into this identity.
    pub fn merge(&mut self, update: IdentityTraits) {
        if update.email.is_some() {
            self.email = update.email;
        }
        if update.phone.is_some() {
            self.phone = update.phone;
        }
        if update.first_name.is_some() {
            self.first_name = update.first_name;
        }
        if update.last_name.is_some() {
            self.last_name = update.last_name;
        }
        if let Some(traits) = update.traits {
            let current = Value::Object(std::mem::take(&mut self.traits));
            if let Value::Object(merged) = deep_merge(current, Value::Object(traits)) {
                self.traits = merged;
            }
        }
    }

    /// Whether no trait has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.email.is_none()
            && self.phone.is_none()
            && self.first_name.is_none()
            && self.last_name.is_none()
            && self.traits.is_empty()
    }
}

impl IdentityTraits {
    /// Trait data as an event property map (used for the `Contact` event).
    pub fn to_properties(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
