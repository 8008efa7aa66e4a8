use std::collections::HashSet;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;

/// One step declared in the flow schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDef {
    pub index: u32,
    pub key: String,
}

/// An optional add-on offered during the flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComplementaryItem {
    pub slug: String,
    pub title: String,
    pub price: String,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_src: Option<String>,
}

impl ComplementaryItem {
    /// Accepts the loose shapes pages ship (`slug`/`value`, `title`/`label`,
    /// `price`/`effective_price`). `None` without a slug.
    pub fn sanitize(raw: &Value) -> Option<Self> {
        let obj = raw.as_object()?;
        let slug = first_scalar(obj, &["slug", "value"])?.trim().to_string();
        if slug.is_empty() {
            return None;
        }
        Some(Self {
            title: first_scalar(obj, &["title", "label"]).unwrap_or_else(|| slug.clone()),
            price: first_scalar(obj, &["price", "effective_price"]).unwrap_or_default(),
            currency: first_scalar(obj, &["currency"]).unwrap_or_default(),
            image_src: first_scalar(obj, &["image_src", "imageSrc", "image"]),
            slug,
        })
    }

    pub fn to_payload(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Parsed `data-ff-config` document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowConfig {
    pub flow_key: Option<String>,
    pub steps: Vec<StepDef>,
    pub complementaries: Vec<ComplementaryItem>,
}

impl FlowConfig {
    pub fn parse(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        Ok(Self::from_value(&value))
    }

    pub fn from_value(value: &Value) -> Self {
        let flow_key = value
            .get("flow_key")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let steps = value
            .pointer("/schema/steps")
            .and_then(Value::as_array)
            .map(|steps| steps.iter().filter_map(step_def).collect())
            .unwrap_or_default();

        let mut seen = HashSet::new();
        let complementaries = value
            .pointer("/context/complementaries")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(ComplementaryItem::sanitize)
                    .filter(|item| seen.insert(item.slug.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            flow_key,
            steps,
            complementaries,
        }
    }

    pub fn step_key(&self, index: u32) -> Option<&str> {
        self.steps
            .iter()
            .find(|step| step.index == index)
            .map(|step| step.key.as_str())
    }

    pub fn complementary(&self, slug: &str) -> Option<&ComplementaryItem> {
        self.complementaries.iter().find(|item| item.slug == slug)
    }
}

fn step_def(raw: &Value) -> Option<StepDef> {
    let obj = raw.as_object()?;
    let index = ["idx", "index", "step_index"]
        .iter()
        .find_map(|key| obj.get(*key))
        .and_then(parse_index)?;
    let key = first_scalar(obj, &["key", "alias", "slug", "name"]).filter(|k| !k.is_empty())?;
    Some(StepDef { index, key })
}

/// Integer-ish attribute or JSON value: `2`, `"2"`, `"2nd"` all give 2.
pub(crate) fn parse_index(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => parse_leading_int(s),
        _ => None,
    }
}

pub(crate) fn parse_leading_int(raw: &str) -> Option<u32> {
    let digits: String = raw
        .trim()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

fn first_scalar(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match obj.get(*key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CONFIG: &str = r#"{
        "flow_key": "checkout",
        "schema": {"steps": [
            {"idx": 1, "key": "contact"},
            {"index": "2", "alias": "extras"},
            {"step_index": 3, "name": "payment"},
            {"key": "orphan"}
        ]},
        "context": {"complementaries": [
            {"slug": "insurance", "title": "Insurance", "price": 12.5, "currency": "EUR"},
            {"value": "gift-wrap", "label": "Gift wrap", "effective_price": "3", "imageSrc": "/g.png"},
            {"slug": "insurance", "title": "Duplicate"},
            {"title": "No slug"}
        ]}
    }"#;

    #[test]
    fn parses_steps_with_alternate_keys() {
        let config = FlowConfig::parse(CONFIG).unwrap();
        assert_eq!(config.flow_key.as_deref(), Some("checkout"));
        assert_eq!(config.step_key(2), Some("extras"));
        assert_eq!(config.step_key(3), Some("payment"));
        assert_eq!(config.steps.len(), 3);
    }

    #[test]
    fn complementaries_are_sanitized_and_deduplicated() {
        let config = FlowConfig::parse(CONFIG).unwrap();
        assert_eq!(
            config.complementaries,
            vec![
                ComplementaryItem {
                    slug: "insurance".into(),
                    title: "Insurance".into(),
                    price: "12.5".into(),
                    currency: "EUR".into(),
                    image_src: None,
                },
                ComplementaryItem {
                    slug: "gift-wrap".into(),
                    title: "Gift wrap".into(),
                    price: "3".into(),
                    currency: String::new(),
                    image_src: Some("/g.png".into()),
                },
            ]
        );
    }

    #[test]
    fn malformed_config_is_an_error() {
        assert!(FlowConfig::parse("{not json").is_err());
        assert_eq!(FlowConfig::from_value(&Value::Null), FlowConfig::default());
    }

    #[test]
    fn leading_int_parsing() {
        assert_eq!(parse_leading_int(" 12px"), Some(12));
        assert_eq!(parse_leading_int("done"), None);
    }
}
