//! Shared test utilities for Casebook crates.

pub mod fixtures;
pub mod runtime;

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Local, TimeZone, Utc};
use mockable::Clock;

use casebook_core::traits::IdGenerator;

pub use runtime::{RuntimeCall, Script, ScriptedRuntime};

/// A clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(DateTime<Utc>);

impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self(now)
    }

    /// `secs` seconds after the Unix epoch.
    pub fn epoch_plus(secs: i64) -> Self {
        Self(Utc.timestamp_opt(secs, 0).single().unwrap_or_default())
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        // 2024-01-01T00:00:00Z
        Self::epoch_plus(1_704_067_200)
    }
}

impl Clock for FixedClock {
    fn local(&self) -> DateTime<Local> {
        self.0.with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Deterministic IDs: `job-1`, `job-2`, ...
#[derive(Debug, Default)]
pub struct SequentialIds {
    next: AtomicUsize,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of IDs handed out so far.
    pub fn issued(&self) -> usize {
        self.next.load(Ordering::SeqCst)
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        format!("job-{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = FixedClock::default();
        assert_eq!(clock.utc().to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert_eq!(clock.utc(), clock.utc());
    }

    #[test]
    fn test_sequential_ids() {
        let ids = SequentialIds::new();
        assert_eq!(ids.next_id(), "job-1");
        assert_eq!(ids.next_id(), "job-2");
        assert_eq!(ids.issued(), 2);
    }
}
