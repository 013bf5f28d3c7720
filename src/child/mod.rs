//! Experiment host run inside the worker subprocess (`exp_worker`).
//!
//! Reads master actions from stdin, answers on stdout, logs to stderr.

pub mod experiments;
pub mod host;

pub use experiments::{Experiment, create};
pub use host::{Host, results_path};
