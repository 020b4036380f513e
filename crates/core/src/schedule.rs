//! Send-time planning seam shared by the state machine and the delivery crate.

use chrono::{DateTime, Utc};

/// Chooses a concrete send time for a step.
pub trait SendTimePlanner: Send + Sync {
    /// Returns a send time at or after `earliest` that satisfies the planner's
    /// window rules.
    fn plan(&self, earliest: DateTime<Utc>) -> DateTime<Utc>;
}

/// Planner that sends as soon as allowed. Useful for tests and dry runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl SendTimePlanner for Immediate {
    fn plan(&self, earliest: DateTime<Utc>) -> DateTime<Utc> {
        earliest
    }
}
