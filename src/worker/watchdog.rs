//! Per-worker watchdog table.
//!
//! User watchdogs get the lowest free non-negative id. The current action's
//! own timeout lives under [`ACTION_WATCHDOG`] so that a single
//! nearest-deadline computation bounds every receive.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Reserved id for the deadline of the action in flight.
pub const ACTION_WATCHDOG: i64 = -1;

#[derive(Debug, Default)]
pub struct Watchdogs {
    deadlines: HashMap<i64, Instant>,
}

impl Watchdogs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user watchdog expiring `timeout` from now.
    pub fn create(&mut self, timeout: Duration) -> i64 {
        let id = (0..)
            .find(|id| !self.deadlines.contains_key(id))
            .unwrap_or_default();
        self.deadlines.insert(id, Instant::now() + timeout);
        id
    }

    /// Remove a watchdog. Returns whether it existed.
    pub fn delete(&mut self, id: i64) -> bool {
        self.deadlines.remove(&id).is_some()
    }

    pub fn set_action_deadline(&mut self, deadline: Instant) {
        self.deadlines.insert(ACTION_WATCHDOG, deadline);
    }

    pub fn clear_action_deadline(&mut self) {
        self.deadlines.remove(&ACTION_WATCHDOG);
    }

    /// Earliest deadline across user watchdogs and the action timeout.
    pub fn nearest(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Push every deadline back, e.g. by the time a run spent paused.
    pub fn shift(&mut self, by: Duration) {
        for deadline in self.deadlines.values_mut() {
            *deadline += by;
        }
    }
}
