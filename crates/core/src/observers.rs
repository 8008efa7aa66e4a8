//! DOM observers. Each one decides *whether* something should be emitted;
//! [`crate::tracker::Tracker`] turns the decision into an event.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use serde_json::{Map, Value};

use crate::page::{Element, ElementId};

pub const ATTR_SLOT_ID: &str = "data-ll-slot-id";
pub const ATTR_CLICK: &str = "data-ll-click";
pub const ATTR_EV: &str = "data-ev";
pub const ATTR_CLICK_PAYLOAD: &str = "data-ll-payload";

/// Fires `view` once per slot container when it becomes visible enough.
pub struct ViewTracker {
    threshold: f64,
    state: Mutex<ViewState>,
}

#[derive(Default)]
struct ViewState {
    observed: HashMap<ElementId, Element>,
    fired: BTreeSet<ElementId>,
}

impl ViewTracker {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            state: Mutex::new(ViewState::default()),
        }
    }

    /// Start watching `target`. Returns false if it is already watched or has
    /// already fired.
    pub fn observe(&self, target: &Element) -> bool {
        let mut state = self.state.lock().expect("ViewTracker poisoned");
        if state.fired.contains(&target.id()) || state.observed.contains_key(&target.id()) {
            return false;
        }
        state.observed.insert(target.id(), target.clone());
        true
    }

    /// Intersection callback. Returns the element to emit `view` for, at most
    /// once per element; the element is unobserved when it fires.
    pub fn on_intersection(&self, target: &Element, ratio: f64) -> Option<Element> {
        if ratio.is_nan() || ratio < self.threshold {
            return None;
        }
        let mut state = self.state.lock().expect("ViewTracker poisoned");
        let element = state.observed.remove(&target.id())?;
        state.fired.insert(element.id());
        Some(element)
    }

    /// Without intersection support every watched target counts as seen.
    pub fn fire_all(&self) -> Vec<Element> {
        let mut state = self.state.lock().expect("ViewTracker poisoned");
        let mut fired: Vec<Element> = state.observed.drain().map(|(_, el)| el).collect();
        fired.sort_by_key(Element::id);
        for el in &fired {
            state.fired.insert(el.id());
        }
        fired
    }

    pub fn observed_count(&self) -> usize {
        self.state.lock().expect("ViewTracker poisoned").observed.len()
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

/// A resolved click: the marked element, its conversion name and payload.
#[derive(Debug, Clone)]
pub struct ClickHit {
    pub target: Element,
    pub name: String,
    pub payload: Map<String, Value>,
}

/// Maps raw clicks to `[data-ll-click]` / `[data-ev]` targets.
#[derive(Default)]
pub struct ClickTracker {
    lazy_ids: Mutex<HashMap<ElementId, String>>,
    next_lazy_id: AtomicU64,
}

impl ClickTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a click on `origin`. `None` when no marked ancestor exists.
    pub fn resolve(&self, origin: &Element) -> Option<ClickHit> {
        let target = origin
            .closest(|el| el.has_attr(ATTR_CLICK))
            .or_else(|| origin.closest(|el| el.has_attr(ATTR_EV)))?;

        let name = target
            .attr_non_empty(ATTR_CLICK)
            .or_else(|| target.attr_non_empty(ATTR_EV))
            .unwrap_or_default()
            .to_string();

        let extra = target
            .attr_non_empty(ATTR_CLICK_PAYLOAD)
            .map(parse_click_payload)
            .unwrap_or_default();

        let id = target
            .attr_non_empty("data-id")
            .or_else(|| target.attr_non_empty("data-ll-id"))
            .map(str::to_string)
            .unwrap_or_else(|| self.lazy_id(target.id()));

        let mut payload = Map::new();
        payload.insert("ev".into(), Value::String(name.clone()));
        payload.insert("id".into(), Value::String(id));
        for (key, value) in extra {
            payload.insert(key, value);
        }

        Some(ClickHit {
            target: target.clone(),
            name,
            payload,
        })
    }

    fn lazy_id(&self, element: ElementId) -> String {
        let mut ids = self.lazy_ids.lock().expect("ClickTracker poisoned");
        ids.entry(element)
            .or_insert_with(|| {
                let n = self.next_lazy_id.fetch_add(1, Ordering::Relaxed) + 1;
                format!("ll-{n}")
            })
            .clone()
    }
}

fn parse_click_payload(raw: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(obj)) => obj,
        Ok(_) => Map::new(),
        Err(err) => {
            tracing::debug!(%err, "ignoring malformed click payload");
            Map::new()
        }
    }
}

/// Document scroll geometry at the time of a scroll event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollMetrics {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
}

impl ScrollMetrics {
    /// Rounded depth in percent, `None` for pages that cannot scroll.
    pub fn depth_pct(&self) -> Option<u32> {
        let max = self.scroll_height - self.client_height;
        if max.is_nan() || max <= 0.0 || !self.scroll_top.is_finite() {
            return None;
        }
        let pct = (self.scroll_top / max * 100.0).round().clamp(0.0, 100.0);
        Some(pct as u32)
    }
}

/// Scroll depth milestones. Each fires once, in ascending order.
pub struct ScrollTracker {
    milestones: Vec<u8>,
    passed: Mutex<BTreeSet<u8>>,
}

impl ScrollTracker {
    pub fn new(mut milestones: Vec<u8>) -> Self {
        milestones.sort_unstable();
        milestones.dedup();
        Self {
            milestones,
            passed: Mutex::new(BTreeSet::new()),
        }
    }

    /// Milestones crossed for the first time by this scroll position.
    pub fn on_scroll(&self, metrics: ScrollMetrics) -> Vec<u8> {
        let Some(depth) = metrics.depth_pct() else {
            return Vec::new();
        };
        let mut passed = self.passed.lock().expect("ScrollTracker poisoned");
        self.milestones
            .iter()
            .copied()
            .filter(|mark| u32::from(*mark) <= depth && passed.insert(*mark))
            .collect()
    }

    pub fn passed(&self) -> Vec<u8> {
        self.passed
            .lock()
            .expect("ScrollTracker poisoned")
            .iter()
            .copied()
            .collect()
    }
}

/// Bounding box of the heatmap container, in client coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

pub struct HeatmapSampler {
    rate: f64,
}

impl HeatmapSampler {
    pub fn new(rate: f64) -> Self {
        Self {
            rate: rate.clamp(0.0, 1.0),
        }
    }

    /// Container-relative position of a click, or `None` outside [0,1]².
    pub fn locate(rect: Rect, client_x: f64, client_y: f64) -> Option<(f64, f64)> {
        if rect.width <= 0.0 || rect.height <= 0.0 || rect.width.is_nan() || rect.height.is_nan() {
            return None;
        }
        let x = (client_x - rect.left) / rect.width;
        let y = (client_y - rect.top) / rect.height;
        ((0.0..=1.0).contains(&x) && (0.0..=1.0).contains(&y)).then_some((x, y))
    }

    /// Sampled [`HeatmapSampler::locate`].
    pub fn sample(&self, rect: Rect, client_x: f64, client_y: f64) -> Option<(f64, f64)> {
        if self.rate < 1.0 && rand::random::<f64>() >= self.rate {
            return None;
        }
        Self::locate(rect, client_x, client_y)
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn view_fires_once_at_threshold() {
        let views = ViewTracker::new(0.35);
        let slot = Element::new("section").with_attr(ATTR_SLOT_ID, "hero");
        assert!(views.observe(&slot));
        assert!(!views.observe(&slot));

        assert!(views.on_intersection(&slot, 0.2).is_none());
        assert!(views.on_intersection(&slot, 0.35).is_some());
        assert!(views.on_intersection(&slot, 1.0).is_none());
        assert!(!views.observe(&slot));
    }

    #[test]
    fn view_fallback_fires_every_target() {
        let views = ViewTracker::new(0.35);
        let a = Element::new("section");
        let b = Element::new("section");
        views.observe(&a);
        views.observe(&b);
        let fired: Vec<_> = views.fire_all().iter().map(Element::id).collect();
        assert_eq!(fired, vec![a.id(), b.id()]);
        assert_eq!(views.observed_count(), 0);
        assert!(views.fire_all().is_empty());
    }

    #[test]
    fn click_resolves_marked_ancestor() {
        let button = Arc::new(
            Element::new("a")
                .with_attr(ATTR_CLICK, "cta_buy")
                .with_attr("data-id", "buy-top")
                .with_attr(ATTR_CLICK_PAYLOAD, r#"{"plan":"pro"}"#),
        );
        let icon = Element::new("svg").with_parent(button.clone());

        let hit = ClickTracker::new().resolve(&icon).unwrap();
        assert_eq!(hit.target.id(), button.id());
        assert_eq!(hit.name, "cta_buy");
        assert_eq!(
            Value::Object(hit.payload),
            json!({"ev": "cta_buy", "id": "buy-top", "plan": "pro"})
        );
    }

    #[test]
    fn click_payload_must_be_an_object() {
        let clicks = ClickTracker::new();
        let array = Element::new("button")
            .with_attr(ATTR_EV, "x")
            .with_attr(ATTR_CLICK_PAYLOAD, "[1,2]");
        let broken = Element::new("button")
            .with_attr(ATTR_EV, "y")
            .with_attr(ATTR_CLICK_PAYLOAD, "{nope");
        assert_eq!(clicks.resolve(&array).unwrap().payload.len(), 2);
        assert_eq!(clicks.resolve(&broken).unwrap().payload.len(), 2);
        assert!(clicks.resolve(&Element::new("div")).is_none());
    }

    #[test]
    fn lazy_click_ids_are_stable_per_element() {
        let clicks = ClickTracker::new();
        let first = Element::new("button").with_attr(ATTR_EV, "a");
        let second = Element::new("button").with_attr(ATTR_EV, "b");
        let id = |el: &Element| clicks.resolve(el).unwrap().payload["id"].clone();
        assert_eq!(id(&first), json!("ll-1"));
        assert_eq!(id(&second), json!("ll-2"));
        assert_eq!(id(&first.clone()), json!("ll-1"));
    }

    #[test]
    fn scroll_milestones_fire_once_ascending() {
        let scroll = ScrollTracker::new(vec![100, 25, 50, 75, 90]);
        let at = |top: f64| ScrollMetrics {
            scroll_top: top,
            scroll_height: 2000.0,
            client_height: 1000.0,
        };
        assert_eq!(scroll.on_scroll(at(600.0)), vec![25, 50]);
        assert_eq!(scroll.on_scroll(at(300.0)), Vec::<u8>::new());
        assert_eq!(scroll.on_scroll(at(1000.0)), vec![75, 90, 100]);
        assert_eq!(scroll.passed(), vec![25, 50, 75, 90, 100]);
    }

    #[test]
    fn short_pages_never_emit_scroll() {
        let scroll = ScrollTracker::new(vec![25]);
        let flat = ScrollMetrics {
            scroll_top: 0.0,
            scroll_height: 800.0,
            client_height: 800.0,
        };
        assert!(scroll.on_scroll(flat).is_empty());
    }

    #[test]
    fn heatmap_discards_points_outside_container() {
        let rect = Rect {
            left: 100.0,
            top: 50.0,
            width: 200.0,
            height: 100.0,
        };
        assert_eq!(HeatmapSampler::locate(rect, 200.0, 100.0), Some((0.5, 0.5)));
        assert_eq!(HeatmapSampler::locate(rect, 99.0, 100.0), None);

        assert!(HeatmapSampler::new(1.0).sample(rect, 150.0, 75.0).is_some());
        assert!(HeatmapSampler::new(0.0).sample(rect, 150.0, 75.0).is_none());
    }
}
