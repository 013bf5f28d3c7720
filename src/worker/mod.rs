//! Worker subprocess management.
//!
//! Core components:
//! - `worker` — one subprocess per run, request/reply over stdin/stdout
//! - `handlers` — capability object serving worker-initiated requests
//! - `watchdog` — per-worker deadline table
//! - `termination` — escalating shutdown (message → SIGTERM → SIGKILL)

pub mod handlers;
pub mod termination;
pub mod watchdog;
#[allow(clippy::module_inception)]
pub mod worker;

pub use handlers::{DetachedHandlers, WorkerHandlers};
pub use termination::Termination;
pub use watchdog::{ACTION_WATCHDOG, Watchdogs};
pub use worker::{CloseSignal, RunOutcome, Worker};
