//! Exp Master: experiment scheduling and execution pipeline.

pub mod api;
pub mod child;
pub mod config;
pub mod datasets;
pub mod error;
pub mod notifier;
pub mod protocol;
pub mod repository;
pub mod rid;
pub mod scheduler;
pub mod worker;
