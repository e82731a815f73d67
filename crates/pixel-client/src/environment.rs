//! Host environment capability.
//!
//! Everything the payload builder needs to know about "where" an event
//! happens comes through [`Environment`]: the current page, the device, and
//! the host's optional product-context bridge. A browser binding implements
//! it over the DOM; [`StaticEnvironment`] serves the CLI and tests.

use parking_lot::RwLock;
use serde_json::{Map, Value};

/// Current page as seen by the host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PageContext {
    /// Full page URL.
    pub url: String,
    /// Document title.
    pub title: Option<String>,
    /// Referrer URL.
    pub referrer: Option<String>,
}

/// Client-hints style user-agent data. Only some hosts expose it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserAgentData {
    /// Brand names, most significant first. May include GREASE entries.
    pub brands: Vec<String>,
    /// Operating system platform.
    pub platform: Option<String>,
    /// Whether the host reports itself as mobile.
    pub mobile: bool,
}

impl UserAgentData {
    /// First meaningful brand, skipping GREASE placeholders like `Not A(Brand`.
    pub fn browser(&self) -> Option<String> {
        self.brands
            .iter()
            .find(|brand| !brand.to_lowercase().starts_with("not") && !brand.trim().is_empty())
            .cloned()
    }
}

/// Device characteristics as seen by the host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceContext {
    /// Raw user agent string.
    pub user_agent: String,
    /// Preferred language tag.
    pub language: Option<String>,
    /// Browser vendor.
    pub vendor: Option<String>,
    /// Platform string.
    pub platform: Option<String>,
    /// Screen width.
    pub screen_width: Option<u32>,
    /// Screen height.
    pub screen_height: Option<u32>,
    /// Colour depth in bits.
    pub color_depth: Option<u32>,
    /// IANA timezone name.
    pub timezone: Option<String>,
    /// Optional client-hints data.
    pub user_agent_data: Option<UserAgentData>,
}

/// Source of page, device and product-context snapshots.
pub trait Environment: Send + Sync {
    /// Snapshot of the current page.
    fn page(&self) -> PageContext;

    /// Snapshot of the device.
    fn device(&self) -> DeviceContext;

    /// Page-level commerce data published by the host (price, currency, ...).
    fn product_context(&self) -> Option<Map<String, Value>> {
        None
    }
}

/// Environment with fixed device data and a navigable page.
#[derive(Debug, Default)]
pub struct StaticEnvironment {
    page: RwLock<PageContext>,
    device: DeviceContext,
    product_context: Option<Map<String, Value>>,
}

impl StaticEnvironment {
    /// Create an environment at `url`.
    pub fn new(url: impl Into<String>, device: DeviceContext) -> Self {
        Self {
            page: RwLock::new(PageContext {
                url: url.into(),
                ..PageContext::default()
            }),
            device,
            product_context: None,
        }
    }

    /// Set the document title.
    #[must_use]
    pub fn with_title(self, title: impl Into<String>) -> Self {
        self.page.write().title = Some(title.into());
        self
    }

    /// Set the referrer.
    #[must_use]
    pub fn with_referrer(self, referrer: impl Into<String>) -> Self {
        self.page.write().referrer = Some(referrer.into());
        self
    }

    /// Publish product-context data.
    #[must_use]
    pub fn with_product_context(mut self, context: Map<String, Value>) -> Self {
        self.product_context = Some(context);
        self
    }

    /// Move to a new URL (single-page navigation). The old URL becomes the referrer.
    pub fn navigate(&self, url: impl Into<String>) {
        let mut page = self.page.write();
        let previous = std::mem::replace(&mut page.url, url.into());
        page.referrer = Some(previous);
    }
}

impl Environment for StaticEnvironment {
    fn page(&self) -> PageContext {
        self.page.read().clone()
    }

    fn device(&self) -> DeviceContext {
        self.device.clone()
    }

    fn product_context(&self) -> Option<Map<String, Value>> {
        self.product_context.clone()
    }
}
