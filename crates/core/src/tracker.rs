//! The booted tracker: one `emit` entrypoint fed by observers, the data
//! layer and the flow tracker, backed by the dispatch worker.

use std::sync::{Arc, Mutex, Weak};

use serde_json::{Map, Value};
use tokio::{sync::broadcast, task::JoinHandle};

use crate::{
    config::TrackerConfig,
    consent::ConsentGate,
    dispatch::{DispatchWorker, Dispatcher, FlushOutcome, Lifecycle, MetricsSnapshot},
    error::Result,
    events::{
        DataLayer, DataLayerEntry, EventContext, EventKind, EventRecord, EventType, Normalizer,
        ORIGIN_KEY, ORIGIN_TRACKER, Subscription,
    },
    observers::{
        ATTR_SLOT_ID, ClickTracker, HeatmapSampler, Rect, ScrollMetrics, ScrollTracker,
        ViewTracker,
    },
    page::{Element, Page},
    transport::{Beacon, BeaconFirstTransport, HttpTransport, Transport},
};

pub const ATTR_PAGE_ID: &str = "data-ll-page-id";
pub const ATTR_ALIAS: &str = "data-ll-alias";

/// Anything that accepts events through the `emit` contract.
pub trait EventSink: Send + Sync {
    /// `None` when the event was dropped (unknown shape, missing fields).
    fn emit(
        &self,
        event_type: EventType,
        source: Option<&Element>,
        payload: Map<String, Value>,
    ) -> Option<EventRecord>;
}

#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    page: Arc<Page>,
    config: TrackerConfig,
    normalizer: Normalizer,
    dispatcher: Dispatcher,
    data_layer: DataLayer,
    views: ViewTracker,
    clicks: ClickTracker,
    scroll: ScrollTracker,
    heatmap: HeatmapSampler,
    subscription: Mutex<Option<Subscription>>,
}

/// Owns the dispatch worker task. Dropping the handle leaves the worker
/// running; call [`TrackerHandle::shutdown`] for a final flush.
pub struct TrackerHandle {
    pub tracker: Tracker,
    pub shutdown_tx: broadcast::Sender<()>,
    worker: JoinHandle<anyhow::Result<()>>,
}

impl TrackerHandle {
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.tracker.detach();
        let _ = self.shutdown_tx.send(());
        self.worker.await?
    }
}

impl Tracker {
    /// Default transport for a page: beacon first when the page supports
    /// it, then HTTP POST to the resolved collect URL.
    pub fn page_transport(
        page: &Page,
        config: &TrackerConfig,
        beacon: Option<Arc<dyn Beacon>>,
    ) -> Result<Arc<dyn Transport>> {
        let url = page.resolve_url(&config.collect_url);
        let http = Arc::new(HttpTransport::new(url.clone(), config.request_timeout())?);
        let beacon = beacon.filter(|_| page.capabilities().beacon);
        Ok(Arc::new(BeaconFirstTransport::new(beacon, url, http)))
    }

    /// Start tracking `page`. Returns `None`, with nothing installed, when
    /// consent is missing or the page already has a tracker.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn boot(
        page: Arc<Page>,
        data_layer: DataLayer,
        config: TrackerConfig,
        transport: Arc<dyn Transport>,
    ) -> Option<TrackerHandle> {
        let gate = ConsentGate::evaluate(&page, &config.default_consent_cookie);
        if !gate.is_analytics_allowed() {
            tracing::debug!(cookie = gate.cookie_name(), "analytics consent missing, not booting");
            return None;
        }
        if !page.claim_analytics_init() {
            tracing::debug!("analytics already initialized for this page");
            return None;
        }

        let (dispatcher, worker) = Dispatcher::new(&config, transport);
        let tracker = Self {
            inner: Arc::new(TrackerInner {
                normalizer: Normalizer::for_page(&page),
                views: ViewTracker::new(config.view_threshold),
                clicks: ClickTracker::new(),
                scroll: ScrollTracker::new(config.milestones()),
                heatmap: HeatmapSampler::new(config.heatmap_sample_rate),
                subscription: Mutex::new(None),
                page,
                config,
                dispatcher,
                data_layer,
            }),
        };
        tracker.attach();

        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let worker = tokio::spawn(run_worker(worker, shutdown_rx));

        tracing::info!(
            page = tracker.inner.page.path(),
            batch_size = tracker.inner.config.batch_size,
            "analytics tracker booted"
        );
        Some(TrackerHandle {
            tracker,
            shutdown_tx,
            worker,
        })
    }

    fn attach(&self) {
        let layer = &self.inner.data_layer;
        layer.install_decoration(self.inner.page.capabilities().crypto_rng);

        let weak: Weak<TrackerInner> = Arc::downgrade(&self.inner);
        let subscription = layer.on(move |entry| {
            if let Some(inner) = weak.upgrade() {
                Tracker { inner }.ingest(entry);
            }
        });
        *self
            .inner
            .subscription
            .lock()
            .expect("tracker subscription poisoned") = Some(subscription);
    }

    fn detach(&self) {
        let subscription = self
            .inner
            .subscription
            .lock()
            .expect("tracker subscription poisoned")
            .take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
    }

    /// Data layer ingress. Entries the tracker mirrored itself are skipped.
    fn ingest(&self, entry: &DataLayerEntry) {
        if entry.is_tracker_mirror() {
            return;
        }
        if let Some(record) = self.inner.normalizer.normalize(&entry.value) {
            self.inner.dispatcher.enqueue(record);
        }
    }

    fn context_for(&self, source: &Element) -> EventContext {
        let slot = source.closest_with_attr(ATTR_SLOT_ID);
        let slot_attr = |name: &str| {
            slot.and_then(|s| s.attr_non_empty(name))
                .map(str::to_string)
        };
        EventContext {
            page_id: slot_attr(ATTR_PAGE_ID).unwrap_or_default(),
            slot_id: slot_attr(ATTR_SLOT_ID).unwrap_or_default(),
            component_alias: slot_attr(ATTR_ALIAS)
                .or_else(|| source.attr_non_empty(ATTR_ALIAS).map(str::to_string))
                .unwrap_or_default(),
            site_version: None,
            request_id: None,
        }
    }

    fn mirror(&self, record: &EventRecord) {
        let name = match record.event_type {
            EventType::Conversion => ["ev", "event"]
                .iter()
                .find_map(|key| record.payload.get(*key).and_then(Value::as_str))
                .filter(|s| !s.is_empty())
                .unwrap_or("ll_event")
                .to_string(),
            other => format!("ll_{other}"),
        };

        let mut flat = Map::new();
        flat.insert("event".into(), Value::String(name));
        flat.insert("ll_event_type".into(), Value::String(record.event_type.to_string()));
        flat.insert("ll_page_id".into(), Value::String(record.page_id.clone()));
        flat.insert("ll_slot_id".into(), Value::String(record.slot_id.clone()));
        flat.insert(
            "ll_component_alias".into(),
            Value::String(record.component_alias.clone()),
        );
        flat.insert("event_uuid".into(), Value::String(record.event_uuid.clone()));
        flat.insert("id_event".into(), Value::String(record.id_event.clone()));
        for (key, value) in &record.payload {
            flat.insert(key.clone(), value.clone());
        }
        if !matches!(flat.get("id_event"), Some(Value::String(s)) if !s.is_empty()) {
            flat.insert("id_event".into(), Value::String(record.id_event.clone()));
        }
        flat.insert(ORIGIN_KEY.into(), Value::String(ORIGIN_TRACKER.into()));

        self.inner.data_layer.push(Value::Object(flat));
    }

    /// Register slot containers for view tracking. Without intersection
    /// support every target fires right away.
    pub fn observe_views<'a>(&self, targets: impl IntoIterator<Item = &'a Element>) {
        for target in targets {
            self.inner.views.observe(target);
        }
        if !self.inner.page.capabilities().intersection_observer {
            for element in self.inner.views.fire_all() {
                self.emit(EventType::View, Some(&element), Map::new());
            }
        }
    }

    pub fn on_intersection(&self, target: &Element, ratio: f64) -> Option<EventRecord> {
        let element = self.inner.views.on_intersection(target, ratio)?;
        self.emit(EventType::View, Some(&element), Map::new())
    }

    pub fn on_click(&self, origin: &Element) -> Option<EventRecord> {
        let hit = self.inner.clicks.resolve(origin)?;
        self.emit(EventType::Click, Some(&hit.target), hit.payload)
    }

    pub fn on_scroll(&self, metrics: ScrollMetrics) -> Vec<EventRecord> {
        self.inner
            .scroll
            .on_scroll(metrics)
            .into_iter()
            .filter_map(|mark| {
                let mut payload = Map::new();
                payload.insert("scroll_pct".into(), Value::from(mark));
                self.emit(EventType::Scroll, None, payload)
            })
            .collect()
    }

    pub fn on_heatmap_click(
        &self,
        container: &Element,
        rect: Rect,
        client_x: f64,
        client_y: f64,
    ) -> Option<EventRecord> {
        let (x, y) = self.inner.heatmap.sample(rect, client_x, client_y)?;
        let mut payload = Map::new();
        payload.insert("x".into(), Value::from(x));
        payload.insert("y".into(), Value::from(y));
        self.emit(EventType::Heatmap, Some(container), payload)
    }

    pub fn lifecycle(&self, signal: Lifecycle) {
        self.inner.dispatcher.lifecycle(signal);
    }

    pub async fn flush(&self) -> FlushOutcome {
        self.inner.dispatcher.flush().await
    }

    pub fn queue_len(&self) -> usize {
        self.inner.dispatcher.queue_len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.dispatcher.metrics()
    }

    pub fn page(&self) -> &Page {
        &self.inner.page
    }

    pub fn data_layer(&self) -> &DataLayer {
        &self.inner.data_layer
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }
}

impl EventSink for Tracker {
    fn emit(
        &self,
        event_type: EventType,
        source: Option<&Element>,
        payload: Map<String, Value>,
    ) -> Option<EventRecord> {
        let Some(kind) = EventKind::from_payload(event_type, &payload) else {
            tracing::debug!(%event_type, "emit dropped invalid payload");
            return None;
        };
        let context = self.context_for(source.unwrap_or_else(|| self.inner.page.body()));
        let record = self.inner.normalizer.record(kind, context, payload);
        self.inner.dispatcher.enqueue(record.clone());
        self.mirror(&record);
        Some(record)
    }
}

async fn run_worker(
    worker: DispatchWorker,
    shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let result = worker.run(shutdown).await;
    if let Err(err) = &result {
        tracing::error!(%err, "dispatch worker stopped");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{page::Capabilities, transport::RecordingTransport};
    use serde_json::json;

    fn consenting_page() -> Arc<Page> {
        Arc::new(Page::new("https://shop.test", "/products/widget").with_cookie("cookie_consent_marketing=yes"))
    }

    fn boot(page: Arc<Page>) -> (TrackerHandle, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::new());
        let handle = Tracker::boot(page, DataLayer::new(), TrackerConfig::default(), transport.clone())
            .expect("tracker should boot");
        (handle, transport)
    }

    #[tokio::test]
    async fn denied_consent_installs_nothing() {
        let page = Arc::new(Page::new("https://shop.test", "/"));
        let layer = DataLayer::new();
        let booted = Tracker::boot(
            page.clone(),
            layer.clone(),
            TrackerConfig::default(),
            Arc::new(RecordingTransport::new()),
        );
        assert!(booted.is_none());
        assert_eq!(layer.listener_count(), 0);
        assert!(!layer.is_decorated());
        assert!(!page.analytics_initialized());
    }

    #[tokio::test]
    async fn second_boot_on_same_page_is_refused() {
        let page = consenting_page();
        let (_handle, _) = boot(page.clone());
        let again = Tracker::boot(
            page,
            DataLayer::new(),
            TrackerConfig::default(),
            Arc::new(RecordingTransport::new()),
        );
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn emit_reads_slot_context_and_mirrors() {
        let (handle, _) = boot(consenting_page());
        let slot = Arc::new(
            Element::new("section")
                .with_attr(ATTR_SLOT_ID, "hero")
                .with_attr(ATTR_PAGE_ID, "product_detail")
                .with_attr(ATTR_ALIAS, "Hero Banner"),
        );
        let button = Element::new("button")
            .with_attr("data-ll-click", "cta_buy")
            .with_parent(slot);

        let record = handle.tracker.on_click(&button).unwrap();
        assert_eq!(record.page_id, "product_detail");
        assert_eq!(record.slot_id, "hero");
        assert_eq!(record.component_alias, "Hero Banner");
        assert_eq!(handle.tracker.queue_len(), 1);

        let entries = handle.tracker.data_layer().entries();
        let mirrored = entries.last().unwrap();
        assert!(mirrored.is_tracker_mirror());
        assert_eq!(mirrored.str_field("event"), Some("ll_click"));
        assert_eq!(mirrored.str_field("ev"), Some("cta_buy"));
        assert_eq!(handle.tracker.queue_len(), 1);
    }

    #[tokio::test]
    async fn data_layer_entries_are_ingested() {
        let (handle, _) = boot(consenting_page());
        let layer = handle.tracker.data_layer().clone();
        layer.push(json!({"event": "gtm.js"}));
        layer.push(json!({"event_type": "conversion", "payload": {"ev": "lead"}}));
        layer.push(json!({"event_type": "scroll", "payload": {}}));
        assert_eq!(handle.tracker.queue_len(), 1);

        layer.push(json!({"event": "ll_scroll", "scroll_pct": 50}));
        assert_eq!(handle.tracker.queue_len(), 2);
    }

    #[tokio::test]
    async fn data_layer_accepts_type_name_and_detail_shapes() {
        let (handle, transport) = boot(consenting_page());
        let layer = handle.tracker.data_layer().clone();
        layer.push(json!({"type": "view"}));
        layer.push(json!({"name": "click", "id": "Buy Now"}));
        layer.push(json!({"detail": {"event_type": "view", "slot_id": "hero"}}));
        assert_eq!(handle.tracker.queue_len(), 3);

        handle.tracker.flush().await;
        let delivered = transport.delivered_events();
        let types: Vec<EventType> = delivered.iter().map(|r| r.event_type).collect();
        assert_eq!(types, vec![EventType::View, EventType::Click, EventType::View]);
        assert_eq!(delivered[1].id_event, "buy_now");
        assert!(!delivered[1].payload.contains_key("name"));
        assert_eq!(delivered[2].slot_id, "hero");
    }

    #[tokio::test]
    async fn views_fire_immediately_without_intersection_support() {
        let page = Arc::new(
            Page::new("https://shop.test", "/")
                .with_cookie("cookie_consent_marketing=1")
                .with_capabilities(Capabilities {
                    intersection_observer: false,
                    ..Capabilities::default()
                }),
        );
        let (handle, _) = boot(page);
        let slots = [
            Element::new("section").with_attr(ATTR_SLOT_ID, "a"),
            Element::new("section").with_attr(ATTR_SLOT_ID, "b"),
        ];
        handle.tracker.observe_views(&slots);
        assert_eq!(handle.tracker.queue_len(), 2);
    }

    #[tokio::test]
    async fn scroll_emits_body_context() {
        let (handle, _) = boot(consenting_page());
        let records = handle.tracker.on_scroll(ScrollMetrics {
            scroll_top: 500.0,
            scroll_height: 1500.0,
            client_height: 500.0,
        });
        let pcts: Vec<_> = records.iter().map(|r| r.payload["scroll_pct"].clone()).collect();
        assert_eq!(pcts, vec![json!(25), json!(50)]);
        assert_eq!(records[0].page_id, "products_widget");
    }

    #[tokio::test]
    async fn shutdown_flushes_queue() {
        let (handle, transport) = boot(consenting_page());
        handle
            .tracker
            .emit(EventType::Conversion, None, Map::from_iter([("ev".to_string(), json!("lead"))]));
        let layer = handle.tracker.data_layer().clone();
        handle.shutdown().await.unwrap();

        assert_eq!(transport.delivered_events().len(), 1);
        assert_eq!(layer.listener_count(), 0);
    }
}
