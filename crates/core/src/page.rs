//! Host page model.
//!
//! The tracker never touches a real browser. The host hands it a [`Page`]
//! (cookies, body attributes, URL, capabilities) and [`Element`] snapshots
//! that carry the marker attributes observers look for.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

static NEXT_ELEMENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(u64);

impl ElementId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// An element snapshot. Clones share the same [`ElementId`], so a clone is
/// the same element instance as far as observers are concerned.
#[derive(Debug, Clone)]
pub struct Element {
    id: ElementId,
    tag: String,
    attrs: BTreeMap<String, String>,
    classes: BTreeSet<String>,
    parent: Option<Arc<Element>>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            id: ElementId(NEXT_ELEMENT_ID.fetch_add(1, Ordering::Relaxed)),
            tag: tag.into().to_ascii_lowercase(),
            attrs: BTreeMap::new(),
            classes: BTreeSet::new(),
            parent: None,
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.classes.insert(class.into());
        self
    }

    pub fn with_parent(mut self, parent: Arc<Element>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn id(&self) -> ElementId {
        self.id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// Attribute value, treating an empty string as absent.
    pub fn attr_non_empty(&self, name: &str) -> Option<&str> {
        self.attr(name).filter(|v| !v.is_empty())
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes.contains(class)
    }

    pub fn parent(&self) -> Option<&Element> {
        self.parent.as_deref()
    }

    /// Self or the nearest ancestor matching `pred`.
    pub fn closest(&self, pred: impl Fn(&Element) -> bool) -> Option<&Element> {
        let mut cur = Some(self);
        while let Some(el) = cur {
            if pred(el) {
                return Some(el);
            }
            cur = el.parent();
        }
        None
    }

    pub fn closest_with_attr(&self, name: &str) -> Option<&Element> {
        self.closest(|el| el.has_attr(name))
    }

    pub fn is_checkable_input(&self) -> bool {
        self.tag == "input" && matches!(self.attr("type"), Some("checkbox") | Some("radio"))
    }
}

/// Browser features the host can or cannot offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub beacon: bool,
    pub intersection_observer: bool,
    pub crypto_rng: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            beacon: true,
            intersection_observer: true,
            crypto_rng: true,
        }
    }
}

#[derive(Debug)]
pub struct Page {
    origin: String,
    path: String,
    cookie: String,
    body: Element,
    capabilities: Capabilities,
    analytics_init: AtomicBool,
    flow_tracking_init: AtomicBool,
}

impl Page {
    pub fn new(origin: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            origin: origin.into().trim_end_matches('/').to_string(),
            path: path.into(),
            cookie: String::new(),
            body: Element::new("body"),
            capabilities: Capabilities::default(),
            analytics_init: AtomicBool::new(false),
            flow_tracking_init: AtomicBool::new(false),
        }
    }

    /// Raw `document.cookie` style string: `a=1; b=2`.
    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = cookie.into();
        self
    }

    pub fn with_body_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.body = self.body.with_attr(name, value);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn cookie_header(&self) -> &str {
        &self.cookie
    }

    pub fn body(&self) -> &Element {
        &self.body
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Resolve a relative collect path against the page origin.
    pub fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else if url.starts_with('/') {
            format!("{}{}", self.origin, url)
        } else {
            format!("{}/{}", self.origin, url)
        }
    }

    /// Returns true exactly once per page. Later calls see the page as
    /// already initialized.
    pub fn claim_analytics_init(&self) -> bool {
        !self.analytics_init.swap(true, Ordering::SeqCst)
    }

    pub fn analytics_initialized(&self) -> bool {
        self.analytics_init.load(Ordering::SeqCst)
    }

    pub fn claim_flow_tracking_init(&self) -> bool {
        !self.flow_tracking_init.swap(true, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closest_walks_ancestors() {
        let slot = Arc::new(Element::new("section").with_attr("data-ll-slot-id", "hero"));
        let inner = Arc::new(Element::new("div").with_parent(slot.clone()));
        let button = Element::new("button").with_parent(inner);

        let found = button.closest_with_attr("data-ll-slot-id").unwrap();
        assert_eq!(found.id(), slot.id());
        assert!(button.closest_with_attr("data-missing").is_none());
    }

    #[test]
    fn clones_keep_identity() {
        let el = Element::new("div");
        let copy = el.clone();
        assert_eq!(el.id(), copy.id());
        assert_ne!(el.id(), Element::new("div").id());
    }

    #[test]
    fn init_is_claimed_once() {
        let page = Page::new("https://shop.test", "/");
        assert!(page.claim_analytics_init());
        assert!(!page.claim_analytics_init());
        assert!(page.analytics_initialized());
    }

    #[test]
    fn resolves_relative_collect_url() {
        let page = Page::new("https://shop.test/", "/p/1");
        assert_eq!(
            page.resolve_url("/api/analytics/collect/"),
            "https://shop.test/api/analytics/collect/"
        );
        assert_eq!(page.resolve_url("https://x.test/c"), "https://x.test/c");
    }
}
