//! Campaign attribution parameters.

use serde::{Deserialize, Serialize};
use url::Url;

/// UTM campaign parameters captured from a landing URL.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtmParams {
    /// Traffic source (`utm_source` / `source`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Marketing medium (`utm_medium` / `medium`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,
    /// Campaign name (`utm_campaign` / `campaign`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign: Option<String>,
    /// Ad content (`utm_content` / `content`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Paid search term (`utm_term` / `term`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub term: Option<String>,
}

impl UtmParams {
    /// Parse UTM parameters from a full URL.
    ///
    /// Both the `utm_`-prefixed and bare forms are accepted; the prefixed
    /// form wins when both are present. Empty values count as absent.
    /// Returns `None` when the URL carries no UTM-like parameter (or does
    /// not parse).
    pub fn from_url(raw: &str) -> Option<Self> {
        let url = Url::parse(raw).ok()?;
        let lookup = |key: &str| -> Option<String> {
            let prefixed = format!("utm_{key}");
            let mut bare = None;
            for (k, v) in url.query_pairs() {
                if v.is_empty() {
                    continue;
                }
                if k == prefixed {
                    return Some(v.into_owned());
                }
                if k == key && bare.is_none() {
                    bare = Some(v.into_owned());
                }
            }
            bare
        };

        let params = Self {
            source: lookup("source"),
            medium: lookup("medium"),
            campaign: lookup("campaign"),
            content: lookup("content"),
            term: lookup("term"),
        };
        (!params.is_empty()).then_some(params)
    }

    /// Whether every field is absent.
    pub fn is_empty(&self) -> bool {
        self.source.is_none()
            && self.medium.is_none()
            && self.campaign.is_none()
            && self.content.is_none()
            && self.term.is_none()
    }
}
