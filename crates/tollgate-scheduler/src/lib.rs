//! Scheduling for Tollgate.
//!
//! Turns trigger events into runs, expands matrices into job instances and
//! drives them through the dependency gate until every instance is terminal.

pub mod dag;
pub mod events;
pub mod gate;
pub mod matrix;
pub mod orchestrator;
pub mod status;
pub mod store;
pub mod triggers;

pub use events::BroadcastEventBus;
pub use gate::{DependencyGate, GateDecision};
pub use matrix::{MatrixExpander, MatrixExpansion};
pub use orchestrator::{CancelHandle, Orchestrator, OrchestratorConfig};
pub use status::{StatusSnapshot, StatusTable};
pub use store::{JsonRunStore, MemoryRunStore};
pub use triggers::{RunRequest, TriggerEvent, TriggerMatcher};
