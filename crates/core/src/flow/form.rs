use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::{
    events::{DataLayer, Subscription},
    flow::{
        config::{ComplementaryItem, FlowConfig},
        state::{FlowState, PanelMarker, StepPanel, StepState, default_step_key},
    },
    page::Element,
};

/// Name of the external completion signal (e.g. payment success).
pub const FLOW_COMPLETE_SIGNAL: &str = "ll_flow_complete";

/// Notifications published by [`FlowForm`] as its state moves.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowChange {
    Started {
        state: FlowState,
    },
    /// A next/submit attempt on `state`, before validation.
    Submitted {
        state: StepState,
    },
    Rejected {
        state: StepState,
        errors: usize,
    },
    Advanced {
        from: StepState,
        to: FlowState,
    },
    Rewound {
        from: StepState,
        to: StepState,
    },
    ComplementaryToggled {
        item: ComplementaryItem,
        selected: bool,
    },
    CompletionSignaled {
        extra: Map<String, Value>,
    },
}

/// Fan-out of [`FlowChange`]s. Every subscriber gets its own unbounded
/// queue, so a slow consumer never misses a change.
#[derive(Clone, Default)]
struct ChangeFeed {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<FlowChange>>>>,
}

impl ChangeFeed {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<FlowChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("flow subscribers poisoned")
            .push(tx);
        rx
    }

    fn send(&self, change: FlowChange) {
        self.subscribers
            .lock()
            .expect("flow subscribers poisoned")
            .retain(|tx| tx.send(change.clone()).is_ok());
    }
}

/// A multi-step form. Owns the flow state; panel visibility is derived from
/// it via [`FlowForm::projection`].
pub struct FlowForm {
    state: FlowState,
    steps: Vec<(u32, Option<String>)>,
    has_done_panel: bool,
    config: FlowConfig,
    feed: ChangeFeed,
}

impl FlowForm {
    pub fn new(state: FlowState, panels: &[StepPanel], config: FlowConfig) -> Self {
        let mut steps: Vec<(u32, Option<String>)> = panels
            .iter()
            .filter_map(|p| p.index().map(|i| (i, p.step_key.clone())))
            .collect();
        steps.sort_by_key(|(i, _)| *i);
        steps.dedup_by_key(|(i, _)| *i);
        if steps.is_empty() {
            steps = (1..=state.step.step_total.max(state.step.step_index))
                .map(|i| (i, None))
                .collect();
        }
        Self {
            state,
            steps,
            has_done_panel: panels.iter().any(|p| p.marker == PanelMarker::Done),
            config,
            feed: ChangeFeed::default(),
        }
    }

    /// Build from markup, deriving the initial state with
    /// [`FlowState::from_dom`].
    pub fn from_dom(sentinel: Option<&Element>, panels: &[StepPanel], config: FlowConfig) -> Self {
        let state = FlowState::from_dom(sentinel, panels, &config);
        Self::new(state, panels, config)
    }

    /// Changes published from now on. The receiver closes once the form and
    /// every [`CompletionSignal`] are dropped.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<FlowChange> {
        self.feed.subscribe()
    }

    pub fn state(&self) -> &FlowState {
        &self.state
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Announce the initial state. Call once subscribers are attached.
    pub fn start(&self) {
        self.publish(FlowChange::Started {
            state: self.state.clone(),
        });
    }

    /// A next/submit attempt. `errors` is the number of invalid controls;
    /// any error rejects the attempt without moving.
    pub fn next(&mut self, errors: usize) -> &FlowState {
        let from = self.state.step.clone();
        self.publish(FlowChange::Submitted {
            state: from.clone(),
        });
        if errors > 0 {
            self.publish(FlowChange::Rejected {
                state: from,
                errors,
            });
            return &self.state;
        }

        let following = self
            .steps
            .iter()
            .find(|(i, _)| *i > from.step_index)
            .cloned();
        self.state = match following {
            Some((index, key)) if !self.state.done => FlowState {
                step: self.step_at(index, key),
                done: false,
            },
            _ => FlowState {
                step: from.clone(),
                done: true,
            },
        };
        self.publish(FlowChange::Advanced {
            from,
            to: self.state.clone(),
        });
        &self.state
    }

    /// Step back one panel. No-op on the first step.
    pub fn back(&mut self) -> &FlowState {
        let from = self.state.step.clone();
        let previous = if self.state.done {
            self.steps.iter().find(|(i, _)| *i == from.step_index).cloned()
        } else {
            self.steps
                .iter()
                .rev()
                .find(|(i, _)| *i < from.step_index)
                .cloned()
        };
        if let Some((index, key)) = previous {
            self.state = FlowState {
                step: self.step_at(index, key),
                done: false,
            };
            self.publish(FlowChange::Rewound {
                from,
                to: self.state.step.clone(),
            });
        }
        &self.state
    }

    /// Select or deselect an add-on. The configured item wins; `element`
    /// supplies `data-ff-complementary-*` fallbacks for unconfigured slugs.
    pub fn toggle_complementary(&self, slug: &str, selected: bool, element: Option<&Element>) {
        let slug = slug.trim();
        if slug.is_empty() {
            return;
        }
        let item = self.config.complementary(slug).cloned().unwrap_or_else(|| {
            let attr = |name: &str| {
                element
                    .and_then(|el| el.attr_non_empty(name))
                    .map(str::to_string)
            };
            ComplementaryItem {
                slug: slug.to_string(),
                title: attr("data-ff-complementary-title").unwrap_or_else(|| slug.to_string()),
                price: attr("data-ff-complementary-price").unwrap_or_default(),
                currency: attr("data-ff-complementary-currency").unwrap_or_default(),
                image_src: attr("data-ff-complementary-image"),
            }
        });
        self.publish(FlowChange::ComplementaryToggled { item, selected });
    }

    /// Toggle from a `[data-ff-complementary]` element. Checkable inputs
    /// report their own checked state; other elements count as a selection.
    pub fn toggle_from_element(&self, element: &Element, checked: Option<bool>) {
        let Some(marked) = element.closest_with_attr("data-ff-complementary") else {
            return;
        };
        let slug = marked
            .attr_non_empty("data-ff-complementary-slug")
            .or_else(|| marked.attr_non_empty("data-slug"))
            .unwrap_or_default();
        let selected = if marked.is_checkable_input() {
            checked.unwrap_or(false)
        } else {
            true
        };
        self.toggle_complementary(slug, selected, Some(marked));
    }

    pub fn signal_completion(&self, extra: Map<String, Value>) {
        self.completion_signal().fire(extra);
    }

    pub fn completion_signal(&self) -> CompletionSignal {
        CompletionSignal {
            feed: self.feed.clone(),
        }
    }

    /// Panel visibility for the current state: `(marker, hidden)` pairs.
    pub fn projection(&self) -> Vec<(PanelMarker, bool)> {
        let mut panels: Vec<(PanelMarker, bool)> = self
            .steps
            .iter()
            .map(|(i, _)| {
                let visible = !self.state.done && *i == self.state.step.step_index;
                (PanelMarker::Step(*i), !visible)
            })
            .collect();
        if self.has_done_panel {
            panels.push((PanelMarker::Done, !self.state.done));
        }
        panels
    }

    fn step_at(&self, index: u32, key: Option<String>) -> StepState {
        StepState {
            flow_key: self.state.step.flow_key.clone(),
            step_key: key
                .or_else(|| self.config.step_key(index).map(str::to_string))
                .unwrap_or_else(|| default_step_key(index)),
            step_index: index,
            step_total: self.state.step.step_total,
        }
    }

    fn publish(&self, change: FlowChange) {
        // No subscribers is fine: analytics may be off.
        self.feed.send(change);
    }
}

/// Cloneable handle that raises the external completion signal.
#[derive(Clone)]
pub struct CompletionSignal {
    feed: ChangeFeed,
}

impl CompletionSignal {
    pub fn fire(&self, extra: Map<String, Value>) {
        self.feed.send(FlowChange::CompletionSignaled { extra });
    }

    /// Raise the signal for every `ll_flow_complete` entry pushed on the
    /// data layer. Its `detail` (or `payload`) object becomes the extra
    /// payload.
    pub fn listen(&self, data_layer: &DataLayer) -> Subscription {
        let signal = self.clone();
        data_layer.on(move |entry| {
            if entry.is_tracker_mirror() || entry.str_field("event") != Some(FLOW_COMPLETE_SIGNAL) {
                return;
            }
            let extra = entry
                .as_object()
                .and_then(|obj| obj.get("detail").or_else(|| obj.get("payload")))
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            signal.fire(extra);
        })
    }
}
