use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    flow::config::{FlowConfig, parse_leading_int},
    page::Element,
};

pub const ATTR_STEP: &str = "data-ff-step";
pub const ATTR_STEP_KEY: &str = "data-ff-step-key";
pub const HIDDEN_CLASS: &str = "d-none";
pub const DONE_MARKER: &str = "done";

/// Position within a flow. Every flow conversion carries it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepState {
    pub flow_key: String,
    pub step_key: String,
    pub step_index: u32,
    pub step_total: u32,
}

impl StepState {
    pub fn to_payload(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("flow_key".into(), Value::String(self.flow_key.clone()));
        map.insert("step_key".into(), Value::String(self.step_key.clone()));
        map.insert("step_index".into(), Value::from(self.step_index));
        map.insert("step_total".into(), Value::from(self.step_total));
        map
    }

    /// `data-flow-key`, `data-step-*` on the sentinel element.
    pub fn from_sentinel(sentinel: &Element) -> Self {
        let index = |name: &str| sentinel.attr(name).and_then(parse_leading_int).unwrap_or(0);
        Self {
            flow_key: sentinel.attr("data-flow-key").unwrap_or_default().to_string(),
            step_key: sentinel.attr("data-step-key").unwrap_or_default().to_string(),
            step_index: index("data-step-index"),
            step_total: index("data-step-total"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelMarker {
    Step(u32),
    Done,
}

/// Snapshot of one `[data-ff-step]` panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepPanel {
    pub marker: PanelMarker,
    pub hidden: bool,
    pub step_key: Option<String>,
}

impl StepPanel {
    pub fn step(index: u32, hidden: bool) -> Self {
        Self {
            marker: PanelMarker::Step(index),
            hidden,
            step_key: None,
        }
    }

    pub fn done(hidden: bool) -> Self {
        Self {
            marker: PanelMarker::Done,
            hidden,
            step_key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.step_key = Some(key.into());
        self
    }

    /// `None` for elements without a usable `data-ff-step`.
    pub fn from_element(el: &Element) -> Option<Self> {
        let raw = el.attr(ATTR_STEP)?.trim();
        let marker = if raw == DONE_MARKER {
            PanelMarker::Done
        } else {
            PanelMarker::Step(parse_leading_int(raw)?)
        };
        Some(Self {
            marker,
            hidden: el.has_class(HIDDEN_CLASS),
            step_key: el.attr_non_empty(ATTR_STEP_KEY).map(str::to_string),
        })
    }

    pub fn index(&self) -> Option<u32> {
        match self.marker {
            PanelMarker::Step(i) => Some(i),
            PanelMarker::Done => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowState {
    pub step: StepState,
    pub done: bool,
}

impl FlowState {
    /// Initial state from the markup: the visible numeric panel wins; with
    /// only the done panel visible the flow is terminal at its last step.
    pub fn from_dom(sentinel: Option<&Element>, panels: &[StepPanel], config: &FlowConfig) -> Self {
        let base = sentinel.map(StepState::from_sentinel).unwrap_or_default();
        let flow_key = if base.flow_key.is_empty() {
            config.flow_key.clone().unwrap_or_default()
        } else {
            base.flow_key.clone()
        };

        if panels.is_empty() {
            let step_index = base.step_index.max(1);
            let step_key = non_empty(base.step_key)
                .or_else(|| config.step_key(step_index).map(str::to_string))
                .unwrap_or_else(|| default_step_key(step_index));
            return Self {
                step: StepState {
                    flow_key,
                    step_key,
                    step_index,
                    step_total: if base.step_total == 0 { step_index } else { base.step_total },
                },
                done: false,
            };
        }

        let done = panels
            .iter()
            .any(|p| p.marker == PanelMarker::Done && !p.hidden);
        let numeric: Vec<&StepPanel> = panels.iter().filter(|p| p.index().is_some()).collect();
        let visible = numeric.iter().rev().find(|p| !p.hidden).copied();
        let last = numeric.iter().copied().max_by_key(|p| p.index());

        let total = match numeric.len() {
            0 => base.step_total.max(1),
            n => n as u32,
        };

        let anchor = visible.or(if done { last } else { None });
        let (step_index, panel_key) = match anchor {
            Some(panel) => (panel.index().unwrap_or(1), panel.step_key.clone()),
            None => {
                let first = numeric.first().and_then(|p| p.index()).unwrap_or(1);
                (if base.step_index == 0 { first } else { base.step_index }, None)
            }
        };

        let step_key = panel_key
            .or_else(|| anchor.and_then(|_| config.step_key(step_index).map(str::to_string)))
            .or_else(|| non_empty(base.step_key.clone()))
            .or_else(|| config.step_key(step_index).map(str::to_string))
            .unwrap_or_else(|| default_step_key(step_index));

        Self {
            step: StepState {
                flow_key,
                step_key,
                step_index,
                step_total: total,
            },
            done,
        }
    }
}

pub(crate) fn default_step_key(index: u32) -> String {
    format!("step{index}")
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}
