use std::sync::{
    Arc, Mutex, OnceLock, Weak,
    atomic::{AtomicU64, Ordering},
};

use serde_json::{Map, Value};

use crate::events::{
    normalize::{generate_uuid, now_iso, type_field, unwrap_detail},
    record::derive_event_id,
};

/// Marker key for entries the tracker mirrors onto the data layer itself.
pub const ORIGIN_KEY: &str = "ll_origin";
pub const ORIGIN_TRACKER: &str = "tracker";

pub type Listener = Arc<dyn Fn(&DataLayerEntry) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct DataLayerEntry {
    pub ingest_seq: u64,
    pub value: Value,
}

impl DataLayerEntry {
    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        self.value.as_object()
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.as_object()?.get(key)?.as_str()
    }

    pub fn is_tracker_mirror(&self) -> bool {
        self.str_field(ORIGIN_KEY) == Some(ORIGIN_TRACKER)
    }
}

/// The page-wide publish/subscribe bus other components push analytics
/// entries into. Construct one per page and hand out clones.
#[derive(Clone)]
pub struct DataLayer {
    inner: Arc<DataLayerInner>,
}

struct DataLayerInner {
    entries: Mutex<Vec<Arc<DataLayerEntry>>>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
    next_ingest_seq: AtomicU64,
    decoration: OnceLock<EntryDecoration>,
}

#[derive(Debug, Clone, Copy)]
struct EntryDecoration {
    crypto_rng: bool,
}

/// Handle returned by [`DataLayer::on`].
pub struct Subscription {
    id: u64,
    layer: Weak<DataLayerInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.layer.upgrade() {
            inner
                .listeners
                .lock()
                .expect("DataLayer listeners poisoned")
                .retain(|(id, _)| *id != self.id);
        }
    }
}

impl Default for DataLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl DataLayer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DataLayerInner {
                entries: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
                next_ingest_seq: AtomicU64::new(0),
                decoration: OnceLock::new(),
            }),
        }
    }

    /// Seed with entries pushed before anyone was listening.
    pub fn with_entries(values: impl IntoIterator<Item = Value>) -> Self {
        let layer = Self::new();
        {
            let mut entries = layer.inner.entries.lock().expect("DataLayer poisoned");
            for value in values {
                let ingest_seq = layer.inner.next_ingest_seq.fetch_add(1, Ordering::Relaxed);
                entries.push(Arc::new(DataLayerEntry { ingest_seq, value }));
            }
        }
        layer
    }

    /// Append an entry and notify listeners. Returns the new length, like
    /// `Array.prototype.push`.
    pub fn push(&self, value: Value) -> usize {
        let value = match self.inner.decoration.get() {
            Some(decoration) => decoration.apply(value),
            None => value,
        };
        let ingest_seq = self.inner.next_ingest_seq.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(DataLayerEntry { ingest_seq, value });

        let len = {
            let mut entries = self.inner.entries.lock().expect("DataLayer poisoned");
            entries.push(Arc::clone(&entry));
            entries.len()
        };

        // Snapshot so listeners may push or unsubscribe re-entrantly.
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .expect("DataLayer listeners poisoned")
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&entry);
        }
        len
    }

    pub fn push_all(&self, values: impl IntoIterator<Item = Value>) -> usize {
        let mut len = self.len();
        for value in values {
            len = self.push(value);
        }
        len
    }

    pub fn on(&self, listener: impl Fn(&DataLayerEntry) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .expect("DataLayer listeners poisoned")
            .push((id, Arc::new(listener)));
        Subscription {
            id,
            layer: Arc::downgrade(&self.inner),
        }
    }

    /// From now on every pushed object gets `ts`, `event_uuid`, `ll_*`
    /// context keys, a default `event` name and an `id_event`. Returns false
    /// if decoration was already installed.
    pub fn install_decoration(&self, crypto_rng: bool) -> bool {
        self.inner
            .decoration
            .set(EntryDecoration { crypto_rng })
            .is_ok()
    }

    pub fn is_decorated(&self) -> bool {
        self.inner.decoration.get().is_some()
    }

    pub fn entries(&self) -> Vec<Arc<DataLayerEntry>> {
        self.inner.entries.lock().expect("DataLayer poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().expect("DataLayer poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .expect("DataLayer listeners poisoned")
            .len()
    }
}

impl EntryDecoration {
    fn apply(&self, value: Value) -> Value {
        let mut entry = match value {
            Value::Object(obj) => obj,
            other => {
                let mut wrapped = Map::new();
                wrapped.insert("value".into(), other);
                wrapped
            }
        };

        // Custom-event envelopes keep their type inside `detail`; the top level
        // stays free of type keys so the normalizer still reads through.
        let source = unwrap_detail(&entry);
        let from_detail = !std::ptr::eq(source, &entry);
        let event_type = type_field(source)
            .map(|(_, raw)| {
                let lowered = raw.trim().to_lowercase();
                lowered.strip_prefix("ll_").unwrap_or(&lowered).to_string()
            })
            .unwrap_or_default();
        let payload = match source.get("payload") {
            Some(Value::Object(p)) => p.clone(),
            _ => Map::new(),
        };
        if !from_detail {
            entry.insert("payload".into(), Value::Object(payload.clone()));
        }
        if !has_text(&entry, "ts") {
            entry.insert("ts".into(), Value::String(now_iso()));
        }
        if !has_text(&entry, "event_uuid") {
            entry.insert(
                "event_uuid".into(),
                Value::String(generate_uuid(self.crypto_rng).to_string()),
            );
        }

        let page_id = first_text(&entry, &["page_id", "ll_page_id"]).unwrap_or_default();
        let slot_id = first_text(&entry, &["slot_id", "ll_slot_id"]).unwrap_or_default();
        let alias =
            first_text(&entry, &["component_alias", "ll_component_alias"]).unwrap_or_default();

        if !from_detail && !event_type.is_empty() && !has_text(&entry, "ll_event_type") {
            entry.insert("ll_event_type".into(), Value::String(event_type.clone()));
        }
        for (key, value) in [
            ("ll_page_id", &page_id),
            ("ll_slot_id", &slot_id),
            ("ll_component_alias", &alias),
        ] {
            if !value.is_empty() && !has_text(&entry, key) {
                entry.insert(key.into(), Value::String(value.clone()));
            }
        }
        if !from_detail && !event_type.is_empty() && !has_text(&entry, "event") {
            entry.insert("event".into(), Value::String(format!("ll_{event_type}")));
        }
        if !has_text(&entry, "id_event") {
            let uuid = first_text(&entry, &["event_uuid"]).unwrap_or_default();
            let id = derive_event_id([&page_id, &slot_id, &alias], &event_type, &payload, &uuid);
            entry.insert("id_event".into(), Value::String(id));
        }
        Value::Object(entry)
    }
}

fn has_text(obj: &Map<String, Value>, key: &str) -> bool {
    matches!(obj.get(key), Some(Value::String(s)) if !s.is_empty())
}

fn first_text(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match obj.get(*key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    })
}
