pub mod bootstrap;
pub mod config;
pub mod consent;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod flow;
pub mod observers;
pub mod page;
pub mod queues;
pub mod tracker;
pub mod transport;

pub use bootstrap::ConsentBootstrap;
pub use config::TrackerConfig;
pub use consent::ConsentGate;
pub use dispatch::{Dispatcher, FlushOutcome, Lifecycle};
pub use error::{Result, TrackError};
pub use events::{DataLayer, EventKind, EventRecord, EventType, Normalizer};
pub use flow::{FlowChange, FlowConfig, FlowForm, FlowState, FlowTracker, PendingSink};
pub use page::{Capabilities, Element, Page};
pub use tracker::{EventSink, Tracker, TrackerHandle};
pub use transport::{Beacon, HttpTransport, RecordingTransport, Transport};
