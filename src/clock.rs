//! Identifier & clock helpers.
//!
//! Centralizing `now()` and id generation behind thin wrappers keeps
//! every other module trivially testable: production code calls
//! [`Clock::system()`], tests construct a [`Clock::fixed`] around a
//! pinned instant.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Generates a new globally-unique, URL-safe job/page identifier.
pub fn new_id() -> Uuid {
    Uuid::new_v4()
}

/// Wall-clock source. `System` delegates to `Utc::now()`; `Fixed` is
/// used by tests that need deterministic timestamps (e.g. to assert
/// `started_at <= completed_at` without racing the real clock).
#[derive(Debug, Clone)]
pub enum Clock {
    System,
    Fixed(DateTime<Utc>),
}

impl Clock {
    pub fn system() -> Self {
        Clock::System
    }

    pub fn fixed(at: DateTime<Utc>) -> Self {
        Clock::Fixed(at)
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Fixed(at) => *at,
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::System
    }
}
