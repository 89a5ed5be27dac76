//! Per-identity debouncing of recognition events.

use chrono::{Duration, NaiveDateTime};
use std::collections::HashMap;

/// Remembers when each identity was last acted upon and suppresses repeats
/// inside the cooldown window.
#[derive(Debug, Clone)]
pub struct CooldownGate {
    window: Duration,
    last_accepted: HashMap<String, NaiveDateTime>,
}

impl CooldownGate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: HashMap::new(),
        }
    }

    /// Whether an event for `name` at `now` falls outside the cooldown window.
    ///
    /// A timestamp earlier than the last accepted one (clock stepped back) is allowed.
    pub fn allow(&self, name: &str, now: NaiveDateTime) -> bool {
        match self.last_accepted.get(name) {
            Some(&last) => {
                let elapsed = now - last;
                elapsed < Duration::zero() || elapsed >= self.window
            }
            None => true,
        }
    }

    pub fn record(&mut self, name: &str, now: NaiveDateTime) {
        self.last_accepted.insert(name.to_string(), now);
    }

    /// `allow` then `record` when allowed.
    pub fn try_accept(&mut self, name: &str, now: NaiveDateTime) -> bool {
        if self.allow(name, now) {
            self.record(name, now);
            true
        } else {
            false
        }
    }

    pub fn last_accepted(&self, name: &str) -> Option<NaiveDateTime> {
        self.last_accepted.get(name).copied()
    }

    pub fn reset(&mut self) {
        self.last_accepted.clear();
    }
}
