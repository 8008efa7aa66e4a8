use std::{
    collections::{HashSet, VecDeque},
    fmt,
    sync::{Arc, Mutex},
};

use serde_json::{Map, Value};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};

use crate::{
    events::{EventRecord, EventType},
    flow::{
        config::{ComplementaryItem, FlowConfig},
        form::FlowChange,
        state::StepState,
    },
    page::{Element, Page},
    tracker::EventSink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversionName {
    StepStart,
    StepSubmit,
    StepComplete,
    ValidationError,
    FlowComplete,
    ComplementarySelect,
    ComplementaryImpression,
}

impl ConversionName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversionName::StepStart => "ff_step_start",
            ConversionName::StepSubmit => "ff_step_submit",
            ConversionName::StepComplete => "ff_step_complete",
            ConversionName::ValidationError => "ff_validation_error",
            ConversionName::FlowComplete => "ff_flow_complete",
            ConversionName::ComplementarySelect => "ff_complementary_select",
            ConversionName::ComplementaryImpression => "ff_complementary_impression",
        }
    }
}

impl fmt::Display for ConversionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conversion {
    pub name: ConversionName,
    pub step: StepState,
    pub extra: Map<String, Value>,
}

impl Conversion {
    fn new(name: ConversionName, step: &StepState) -> Self {
        Self {
            name,
            step: step.clone(),
            extra: Map::new(),
        }
    }

    fn with_extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra = extra;
        self
    }

    /// `{ev, flow_key, step_key, step_index, step_total, ...extra}`.
    pub fn payload(&self) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("ev".into(), Value::String(self.name.as_str().into()));
        payload.extend(self.step.to_payload());
        for (key, value) in &self.extra {
            payload.insert(key.clone(), value.clone());
        }
        payload
    }
}

/// Turns [`FlowChange`] notifications into conversions. Transition and
/// completion conversions are emitted exactly once.
pub struct FlowTracker {
    current: Option<StepState>,
    complete: bool,
    impression_step: u32,
    complementaries: Vec<ComplementaryItem>,
    impressions: HashSet<String>,
}

impl FlowTracker {
    pub fn new(config: &FlowConfig, impression_step: u32) -> Self {
        Self {
            current: None,
            complete: false,
            impression_step,
            complementaries: config.complementaries.clone(),
            impressions: HashSet::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn handle(&mut self, change: &FlowChange) -> Vec<Conversion> {
        let mut out = Vec::new();
        match change {
            FlowChange::Started { state } => {
                self.current = Some(state.step.clone());
                if !state.done {
                    out.push(Conversion::new(ConversionName::StepStart, &state.step));
                    self.impressions_for(&state.step, &mut out);
                }
            }
            FlowChange::Submitted { state } => {
                self.current = Some(state.clone());
                out.push(Conversion::new(ConversionName::StepSubmit, state));
            }
            FlowChange::Rejected { state, errors } => {
                let mut extra = Map::new();
                extra.insert("errors_count".into(), Value::from((*errors).max(1)));
                out.push(Conversion::new(ConversionName::ValidationError, state).with_extra(extra));
            }
            FlowChange::Advanced { from, to } => {
                if to.done {
                    if !self.complete {
                        self.complete = true;
                        out.push(Conversion::new(ConversionName::StepComplete, from));
                        out.push(Conversion::new(ConversionName::FlowComplete, from));
                    }
                } else if to.step != *from {
                    out.push(Conversion::new(ConversionName::StepComplete, from));
                    out.push(Conversion::new(ConversionName::StepStart, &to.step));
                    self.impressions_for(&to.step, &mut out);
                }
                self.current = Some(to.step.clone());
            }
            FlowChange::Rewound { to, .. } => {
                self.current = Some(to.clone());
            }
            FlowChange::ComplementaryToggled { item, selected } => {
                if let Some(step) = &self.current {
                    let mut extra = item.to_payload();
                    extra.insert("selected".into(), Value::Bool(*selected));
                    out.push(
                        Conversion::new(ConversionName::ComplementarySelect, step).with_extra(extra),
                    );
                }
            }
            FlowChange::CompletionSignaled { extra } => {
                if let (false, Some(step)) = (self.complete, &self.current) {
                    out.push(
                        Conversion::new(ConversionName::FlowComplete, step)
                            .with_extra(extra.clone()),
                    );
                    self.complete = true;
                }
            }
        }
        out
    }

    fn impressions_for(&mut self, step: &StepState, out: &mut Vec<Conversion>) {
        if step.step_index != self.impression_step {
            return;
        }
        for item in &self.complementaries {
            if self.impressions.insert(item.slug.clone()) {
                out.push(
                    Conversion::new(ConversionName::ComplementaryImpression, step)
                        .with_extra(item.to_payload()),
                );
            }
        }
    }

    /// Consume notifications until the form goes away or shutdown fires,
    /// emitting every conversion through `sink`.
    pub async fn run(
        mut self,
        mut changes: mpsc::UnboundedReceiver<FlowChange>,
        sink: Arc<dyn EventSink>,
        source: Option<Element>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                change = changes.recv() => {
                    let Some(change) = change else { return Ok(()) };
                    for conversion in self.handle(&change) {
                        tracing::debug!(name = %conversion.name, step = conversion.step.step_index, "flow conversion");
                        sink.emit(EventType::Conversion, source.as_ref(), conversion.payload());
                    }
                }
            }
        }
    }

    /// Spawn [`FlowTracker::run`] unless the page already tracks a flow.
    pub fn spawn(
        self,
        page: &Page,
        changes: mpsc::UnboundedReceiver<FlowChange>,
        sink: Arc<dyn EventSink>,
        source: Option<Element>,
        shutdown: broadcast::Receiver<()>,
    ) -> Option<JoinHandle<anyhow::Result<()>>> {
        if !page.claim_flow_tracking_init() {
            tracing::debug!("flow tracking already initialized for this page");
            return None;
        }
        Some(tokio::spawn(self.run(changes, sink, source, shutdown)))
    }
}

/// Conversions held back while analytics is not loaded yet.
pub const PENDING_LIMIT: usize = 200;

type PendingEmit = (EventType, Option<Element>, Map<String, Value>);

/// An [`EventSink`] that buffers emits until a real sink is attached, so a
/// form can be tracked before consent boots the tracker.
#[derive(Clone, Default)]
pub struct PendingSink {
    state: Arc<Mutex<PendingState>>,
}

#[derive(Default)]
struct PendingState {
    sink: Option<Arc<dyn EventSink>>,
    pending: VecDeque<PendingEmit>,
}

impl PendingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward everything buffered so far, in order, then pass emits straight
    /// through. Returns how many buffered emits were forwarded.
    pub fn attach(&self, sink: Arc<dyn EventSink>) -> usize {
        let mut state = self.state.lock().expect("pending sink poisoned");
        // Drained under the lock so nothing emitted after attach overtakes the backlog.
        let backlog: Vec<PendingEmit> = state.pending.drain(..).collect();
        let forwarded = backlog.len();
        for (event_type, source, payload) in backlog {
            sink.emit(event_type, source.as_ref(), payload);
        }
        state.sink = Some(sink);
        if forwarded > 0 {
            tracing::debug!(forwarded, "flushed pending flow conversions");
        }
        forwarded
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().expect("pending sink poisoned").sink.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().expect("pending sink poisoned").pending.len()
    }
}

impl EventSink for PendingSink {
    fn emit(
        &self,
        event_type: EventType,
        source: Option<&Element>,
        payload: Map<String, Value>,
    ) -> Option<EventRecord> {
        let sink = {
            let mut state = self.state.lock().expect("pending sink poisoned");
            match &state.sink {
                Some(sink) => Arc::clone(sink),
                None => {
                    if state.pending.len() >= PENDING_LIMIT {
                        state.pending.pop_front();
                        tracing::warn!(limit = PENDING_LIMIT, "pending flow conversions full, dropping oldest");
                    }
                    state.pending.push_back((event_type, source.cloned(), payload));
                    return None;
                }
            }
        };
        sink.emit(event_type, source, payload)
    }
}
