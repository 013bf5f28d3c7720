//! Experiment scheduling.
//!
//! - `run` — a run and its status state machine
//! - `pool` — the runs of one pipeline, with a state-changed signal
//! - `stages` — prepare / run / analyze tasks driving runs through a pool
//! - `deleter` — serialized teardown and pipeline garbage collection
//! - `pipeline` — a pool plus its three stage tasks
//! - `scheduler` — the facade owning every pipeline
//! - `handlers` — master-side answers to worker requests

mod deleter;
mod handlers;
mod pipeline;
mod pool;
mod run;
#[allow(clippy::module_inception)]
mod scheduler;
mod stages;

/// Run identifier.
pub type Rid = u64;

pub use deleter::Deleter;
pub use handlers::MasterHandlers;
pub use pipeline::Pipeline;
pub use pool::{RunPool, StateChanged};
pub use run::{PriorityKey, Run, RunSpec, RunStatus};
pub use scheduler::{Scheduler, SchedulerContext, SchedulerDeps};
