//! Evaluation service and the event protocol it emits.

mod events;
mod service;

pub use events::{EvaluationEvent, EvaluationStatus, EventStream, RunSummary};
pub use service::{
    CellSnapshot, ContextFactory, EvaluationService, SessionState, UpdateResult,
    remote_context_factory,
};
