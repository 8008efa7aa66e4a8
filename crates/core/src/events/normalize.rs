use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{
    events::{
        record::{EventContext, EventKind, EventRecord, EventType},
        slug::slug_part,
    },
    page::Page,
};

/// Keys that may carry the event type, in priority order.
const TYPE_KEYS: [&str; 6] = ["event_type", "eventType", "ll_event_type", "event", "type", "name"];

/// Envelope keys that never end up in a flattened payload.
const ENVELOPE_KEYS: [&str; 19] = [
    "payload",
    "event_type",
    "eventType",
    "ll_event_type",
    "event",
    "type",
    "ts",
    "event_uuid",
    "id_event",
    "page_id",
    "ll_page_id",
    "slot_id",
    "ll_slot_id",
    "component_alias",
    "ll_component_alias",
    "site_version",
    "request_id",
    "detail",
    "ll_origin",
];

pub const FALLBACK_PAGE_ID: &str = "page";

/// Page-derived hints, copied once so the normalizer does not borrow the page.
#[derive(Debug, Clone, Default)]
pub struct PageHints {
    pub page_id: Option<String>,
    pub path: String,
    pub site_version: Option<String>,
    pub request_id: Option<String>,
    pub crypto_rng: bool,
}

impl PageHints {
    pub fn from_page(page: &Page) -> Self {
        let body = page.body();
        let owned = |name: &str| body.attr_non_empty(name).map(str::to_string);
        Self {
            page_id: owned("data-page-id").or_else(|| owned("data-ll-page-id")),
            path: page.path().to_string(),
            site_version: owned("data-site-version"),
            request_id: owned("data-request-id"),
            crypto_rng: page.capabilities().crypto_rng,
        }
    }
}

#[derive(Debug, Default)]
struct Sticky {
    page_id: Option<String>,
    site_version: Option<String>,
    request_id: Option<String>,
}

/// Turns arbitrary producer input into [`EventRecord`]s.
///
/// Page id, site version and request id are sticky: the first value seen
/// (explicit or derived) is reused for later events that carry none.
#[derive(Debug)]
pub struct Normalizer {
    hints: PageHints,
    sticky: Mutex<Sticky>,
}

impl Normalizer {
    pub fn new(hints: PageHints) -> Self {
        Self {
            hints,
            sticky: Mutex::new(Sticky::default()),
        }
    }

    pub fn for_page(page: &Page) -> Self {
        Self::new(PageHints::from_page(page))
    }

    /// Adapter for duck-typed producers. `None` means "no event": unknown
    /// type, non-object input, or a scroll/heatmap without its fields.
    pub fn normalize(&self, raw: &Value) -> Option<EventRecord> {
        let outer = raw.as_object()?;
        let obj = unwrap_detail(outer);

        let Some((type_key, type_value)) = type_field(obj) else {
            tracing::debug!("dropping event without a type");
            return None;
        };

        let event_type: EventType = match type_value.parse() {
            Ok(t) => t,
            Err(err) => {
                tracing::debug!(%err, "dropping event");
                return None;
            }
        };

        // Decorated data-layer entries carry an empty `payload` next to flat fields.
        let payload = match obj.get("payload") {
            Some(Value::Object(p)) if !p.is_empty() => p.clone(),
            _ => flatten_payload(obj, type_key, event_type),
        };

        let Some(kind) = EventKind::from_payload(event_type, &payload) else {
            tracing::debug!(event_type = %event_type, "dropping event with invalid payload");
            return None;
        };

        let context = EventContext {
            page_id: String::new(),
            slot_id: text(obj, &["slot_id", "ll_slot_id"]).unwrap_or_default(),
            component_alias: text(obj, &["component_alias", "ll_component_alias"])
                .unwrap_or_default(),
            site_version: None,
            request_id: None,
        };
        let context = self.apply_sticky(obj, context);

        let event_uuid = text(obj, &["event_uuid"])
            .or_else(|| text(outer, &["event_uuid"]))
            .unwrap_or_else(|| self.new_uuid());
        let ts = obj
            .get("ts")
            .or_else(|| outer.get("ts"))
            .and_then(parse_ts)
            .unwrap_or_else(now_iso);

        Some(EventRecord::new(kind, context, payload, event_uuid, ts))
    }

    /// Build a record from an already validated kind (the canonical path for
    /// in-process producers).
    pub fn record(
        &self,
        kind: EventKind,
        context: EventContext,
        payload: Map<String, Value>,
    ) -> EventRecord {
        let mut explicit = Map::new();
        if !context.page_id.is_empty() {
            explicit.insert("page_id".into(), Value::String(context.page_id.clone()));
        }
        let context = self.apply_sticky(&explicit, context);
        EventRecord::new(kind, context, payload, self.new_uuid(), now_iso())
    }

    fn apply_sticky(&self, obj: &Map<String, Value>, mut context: EventContext) -> EventContext {
        let mut sticky = self.sticky.lock().expect("normalizer state poisoned");

        let explicit_page = text(obj, &["page_id", "ll_page_id"]);
        let page_id = explicit_page
            .clone()
            .or_else(|| sticky.page_id.clone())
            .or_else(|| self.hints.page_id.clone())
            .or_else(|| Some(slug_part(&self.hints.path)).filter(|s| !s.is_empty()))
            .unwrap_or_else(|| FALLBACK_PAGE_ID.to_string());
        if sticky.page_id.is_none() {
            sticky.page_id = Some(page_id.clone());
        }
        context.page_id = page_id;

        let site_version = text(obj, &["site_version"])
            .or_else(|| sticky.site_version.clone())
            .or_else(|| self.hints.site_version.clone());
        if sticky.site_version.is_none() {
            sticky.site_version = site_version.clone();
        }
        context.site_version = site_version;

        let request_id = text(obj, &["request_id"])
            .or_else(|| sticky.request_id.clone())
            .or_else(|| self.hints.request_id.clone());
        if sticky.request_id.is_none() {
            sticky.request_id = request_id.clone();
        }
        context.request_id = request_id;

        context
    }

    fn new_uuid(&self) -> String {
        generate_uuid(self.hints.crypto_rng).to_string()
    }
}

/// UUIDv4 from the OS RNG, or from the thread-local RNG when the host has no
/// crypto source.
pub fn generate_uuid(crypto_rng: bool) -> Uuid {
    if crypto_rng {
        Uuid::new_v4()
    } else {
        uuid::Builder::from_random_bytes(rand::random::<[u8; 16]>()).into_uuid()
    }
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(value: &Value) -> Option<String> {
    let parsed: DateTime<Utc> = match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim()).ok()?.with_timezone(&Utc),
        Value::Number(n) => DateTime::<Utc>::from_timestamp_millis(n.as_i64()?)?,
        _ => return None,
    };
    Some(parsed.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// First non-blank type key of `obj` and its raw value.
pub(crate) fn type_field(obj: &Map<String, Value>) -> Option<(&'static str, &str)> {
    TYPE_KEYS.iter().find_map(|key| {
        obj.get(*key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(|s| (*key, s))
    })
}

/// `{detail: {...}}` envelopes (custom-event style) are read through to the
/// detail object unless the outer object names a type itself.
pub(crate) fn unwrap_detail(obj: &Map<String, Value>) -> &Map<String, Value> {
    let has_type = TYPE_KEYS.iter().any(|key| obj.contains_key(*key));
    match obj.get("detail") {
        Some(Value::Object(detail)) if !has_type => detail,
        _ => obj,
    }
}

fn flatten_payload(
    obj: &Map<String, Value>,
    type_key: &str,
    event_type: EventType,
) -> Map<String, Value> {
    obj.iter()
        .filter(|(key, value)| {
            *key != type_key
                && !ENVELOPE_KEYS.contains(&key.as_str())
                && !repeats_type(key, value, event_type)
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// A secondary type key that only restates the resolved type is not payload.
fn repeats_type(key: &str, value: &Value, event_type: EventType) -> bool {
    TYPE_KEYS.contains(&key)
        && value.as_str().and_then(|s| s.parse::<EventType>().ok()) == Some(event_type)
}

fn text(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match obj.get(*key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        _ => None,
    })
}
