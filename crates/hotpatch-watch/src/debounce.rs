//! Event debouncing for continuous compilation
//!
//! Saving a file from an editor produces a burst of change events, and a
//! build touching outputs produces more. The debouncer turns a burst into a
//! single trigger: every event pushes the deadline out, and the trigger
//! fires once the quiet window elapses with nothing new.

use std::time::{Duration, Instant};

pub struct Debouncer {
    window: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    /// Note one event; restarts the quiet window.
    pub fn bump(&mut self) {
        self.deadline = Some(Instant::now() + self.window);
    }

    pub fn bump_at(&mut self, now: Instant) {
        self.deadline = Some(now + self.window);
    }

    /// True when the window has elapsed. Firing clears the deadline, so one
    /// burst yields exactly one trigger.
    pub fn fire(&mut self) -> bool {
        self.fire_at(Instant::now())
    }

    pub fn fire_at(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Drop any pending trigger without firing.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }
}
