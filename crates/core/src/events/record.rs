use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::slug::{EVENT_ID_MAX, slug_part, truncate_chars};

pub const IDENT_MAX: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    View,
    Click,
    Scroll,
    Heatmap,
    Conversion,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::View,
        EventType::Click,
        EventType::Scroll,
        EventType::Heatmap,
        EventType::Conversion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::View => "view",
            EventType::Click => "click",
            EventType::Scroll => "scroll",
            EventType::Heatmap => "heatmap",
            EventType::Conversion => "conversion",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized event type: {0}")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        let bare = lowered.strip_prefix("ll_").unwrap_or(&lowered);
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == bare)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

/// Validated event shape. Scroll and heatmap carry their required numeric
/// fields already clamped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventKind {
    View,
    Click,
    Scroll { scroll_pct: f64 },
    Heatmap { x: f64, y: f64 },
    Conversion,
}

impl EventKind {
    /// Validate a payload for `event_type`. `None` when a required field is
    /// missing or not a finite number.
    pub fn from_payload(event_type: EventType, payload: &Map<String, Value>) -> Option<Self> {
        match event_type {
            EventType::View => Some(EventKind::View),
            EventType::Click => Some(EventKind::Click),
            EventType::Conversion => Some(EventKind::Conversion),
            EventType::Scroll => {
                let pct = number_field(payload, "scroll_pct")?;
                Some(EventKind::Scroll {
                    scroll_pct: pct.clamp(0.0, 100.0),
                })
            }
            EventType::Heatmap => {
                let x = number_field(payload, "x")?;
                let y = number_field(payload, "y")?;
                Some(EventKind::Heatmap {
                    x: x.clamp(0.0, 1.0),
                    y: y.clamp(0.0, 1.0),
                })
            }
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::View => EventType::View,
            EventKind::Click => EventType::Click,
            EventKind::Scroll { .. } => EventType::Scroll,
            EventKind::Heatmap { .. } => EventType::Heatmap,
            EventKind::Conversion => EventType::Conversion,
        }
    }

    fn write_into(&self, payload: &mut Map<String, Value>) {
        match *self {
            EventKind::Scroll { scroll_pct } => {
                payload.insert("scroll_pct".into(), number(scroll_pct));
            }
            EventKind::Heatmap { x, y } => {
                payload.insert("x".into(), number(x));
                payload.insert("y".into(), number(y));
            }
            _ => {}
        }
    }
}

fn number(v: f64) -> Value {
    // Whole numbers go out as integers so `scroll_pct: 50` stays `50`.
    if v.fract() == 0.0 && v.abs() < 1e15 {
        Value::from(v as i64)
    } else {
        serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn number_field(payload: &Map<String, Value>, key: &str) -> Option<f64> {
    let v = match payload.get(key)? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

/// Segmentation identifiers attached to every record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventContext {
    pub page_id: String,
    pub slot_id: String,
    pub component_alias: String,
    pub site_version: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_uuid: String,
    pub event_type: EventType,
    pub ts: String,
    pub page_id: String,
    pub slot_id: String,
    pub component_alias: String,
    pub id_event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl EventRecord {
    /// The one constructor every producer ends up in.
    pub fn new(
        kind: EventKind,
        context: EventContext,
        mut payload: Map<String, Value>,
        event_uuid: String,
        ts: String,
    ) -> Self {
        kind.write_into(&mut payload);
        let mut record = Self {
            event_uuid,
            event_type: kind.event_type(),
            ts,
            page_id: truncate_chars(&context.page_id, IDENT_MAX),
            slot_id: truncate_chars(&context.slot_id, IDENT_MAX),
            component_alias: truncate_chars(&context.component_alias, IDENT_MAX),
            id_event: String::new(),
            site_version: context.site_version,
            request_id: context.request_id,
            payload,
        };
        record.id_event = record.derive_event_id();
        record
    }

    /// Conversion name (`payload.ev`), if any.
    pub fn conversion_name(&self) -> Option<&str> {
        self.payload.get("ev").and_then(Value::as_str)
    }

    fn derive_event_id(&self) -> String {
        derive_event_id(
            [
                self.page_id.as_str(),
                self.slot_id.as_str(),
                self.component_alias.as_str(),
            ],
            self.event_type.as_str(),
            &self.payload,
            &self.event_uuid,
        )
    }
}

/// Human-readable id: payload identifiers first, then the segmentation path
/// (`page__slot__alias__ev__type`), then the uuid.
pub fn derive_event_id(
    segments: [&str; 3],
    event_type: &str,
    payload: &Map<String, Value>,
    event_uuid: &str,
) -> String {
    let preferred = ["id", "event_id", "eventId", "element_id", "elementId", "name"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(scalar_text))
        .map(|v| slug_part(&v))
        .unwrap_or_default();
    if !preferred.is_empty() {
        return preferred;
    }

    let ev = ["ev", "event"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(scalar_text))
        .unwrap_or_default();
    let parts: Vec<String> = [segments[0], segments[1], segments[2], ev.as_str(), event_type]
        .iter()
        .map(|p| slug_part(p))
        .filter(|p| !p.is_empty())
        .collect();

    if parts.is_empty() {
        event_uuid.to_string()
    } else {
        truncate_chars(&parts.join("__"), EVENT_ID_MAX)
    }
}

fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn parses_types_with_legacy_prefix() {
        assert_eq!("VIEW".parse::<EventType>().unwrap(), EventType::View);
        assert_eq!("ll_click".parse::<EventType>().unwrap(), EventType::Click);
        assert!("ff_step_start".parse::<EventType>().is_err());
    }

    #[test]
    fn scroll_requires_numeric_pct() {
        let ok = EventKind::from_payload(EventType::Scroll, &obj(json!({"scroll_pct": 130})));
        assert_eq!(ok, Some(EventKind::Scroll { scroll_pct: 100.0 }));
        let text = EventKind::from_payload(EventType::Scroll, &obj(json!({"scroll_pct": "40"})));
        assert_eq!(text, Some(EventKind::Scroll { scroll_pct: 40.0 }));
        assert!(EventKind::from_payload(EventType::Scroll, &obj(json!({}))).is_none());
        assert!(
            EventKind::from_payload(EventType::Scroll, &obj(json!({"scroll_pct": "deep"})))
                .is_none()
        );
    }

    #[test]
    fn heatmap_clamps_both_axes() {
        let kind = EventKind::from_payload(EventType::Heatmap, &obj(json!({"x": -0.2, "y": 1.7})));
        assert_eq!(kind, Some(EventKind::Heatmap { x: 0.0, y: 1.0 }));
        assert!(EventKind::from_payload(EventType::Heatmap, &obj(json!({"x": 0.5}))).is_none());
    }

    #[test]
    fn event_id_prefers_payload_identifier() {
        let record = EventRecord::new(
            EventKind::Click,
            EventContext {
                page_id: "home".into(),
                ..Default::default()
            },
            obj(json!({"id": "Buy Now!"})),
            "u-1".into(),
            "2024-01-01T00:00:00.000Z".into(),
        );
        assert_eq!(record.id_event, "buy_now");
    }

    #[test]
    fn event_id_falls_back_to_segmentation_path() {
        let record = EventRecord::new(
            EventKind::Conversion,
            EventContext {
                page_id: "product_detail".into(),
                slot_id: "hero".into(),
                component_alias: "Buy Bar".into(),
                ..Default::default()
            },
            obj(json!({"ev": "ff_step_start"})),
            "u-2".into(),
            "2024-01-01T00:00:00.000Z".into(),
        );
        assert_eq!(
            record.id_event,
            "product_detail__hero__buy_bar__ff_step_start__conversion"
        );
    }

    #[test]
    fn identifiers_are_truncated() {
        let record = EventRecord::new(
            EventKind::View,
            EventContext {
                page_id: "p".repeat(300),
                ..Default::default()
            },
            Map::new(),
            "u-3".into(),
            "2024-01-01T00:00:00.000Z".into(),
        );
        assert_eq!(record.page_id.len(), IDENT_MAX);
    }
}
