//! Multi-step form tracking. [`FlowForm`] owns the step state and publishes
//! [`FlowChange`]s; [`FlowTracker`] turns them into `ff_*` conversions.

pub mod config;
pub mod form;
pub mod state;
pub mod tracker;

pub use config::*;
pub use form::*;
pub use state::*;
pub use tracker::*;
