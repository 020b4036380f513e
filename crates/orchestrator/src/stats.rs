//! Aggregate campaign counters and per-loop health.

use std::sync::atomic::{AtomicU64, Ordering};

use campaign_core::types::{CampaignStats, LoopHealth};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Which scheduler loop a health record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    Discovery,
    Dispatch,
    InteractionPoll,
}

impl LoopKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopKind::Discovery => "discovery",
            LoopKind::Dispatch => "dispatch",
            LoopKind::InteractionPoll => "interaction_poll",
        }
    }
}

/// Counter names, one per field of [`CampaignStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    LeadsDiscovered,
    LeadsQualified,
    LeadsManual,
    SequencesStarted,
    SequencesCompleted,
    SequencesPaused,
    SequencesStopped,
    SequencesSwitched,
    SequencesReactivated,
    MessagesSent,
    DeliveryFailures,
    Opens,
    Clicks,
    Replies,
    Unsubscribes,
    Bounces,
    AutoRepliesSent,
    DuplicateCallsSuppressed,
    StaleResultsDiscarded,
}

const COUNTERS: usize = 19;

impl Counter {
    fn slot(self) -> usize {
        self as usize
    }
}

/// Lock-free counters plus mutex-guarded loop health.
pub struct StatsRecorder {
    counters: [AtomicU64; COUNTERS],
    discovery: Mutex<LoopHealth>,
    dispatch: Mutex<LoopHealth>,
    interaction_poll: Mutex<LoopHealth>,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            discovery: Mutex::new(LoopHealth::default()),
            dispatch: Mutex::new(LoopHealth::default()),
            interaction_poll: Mutex::new(LoopHealth::default()),
        }
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.counters[counter.slot()].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.slot()].load(Ordering::Relaxed)
    }

    fn health(&self, kind: LoopKind) -> &Mutex<LoopHealth> {
        match kind {
            LoopKind::Discovery => &self.discovery,
            LoopKind::Dispatch => &self.dispatch,
            LoopKind::InteractionPoll => &self.interaction_poll,
        }
    }

    /// A tick finished without a loop-level error.
    pub fn tick_ok(&self, kind: LoopKind, at: DateTime<Utc>) {
        let mut health = self.health(kind).lock();
        health.ticks += 1;
        health.last_tick_at = Some(at);
        health.consecutive_errors = 0;
    }

    /// A tick failed. The error stays visible until the next failure
    /// replaces it.
    pub fn tick_failed(&self, kind: LoopKind, at: DateTime<Utc>, error: &str) {
        let mut health = self.health(kind).lock();
        health.ticks += 1;
        health.last_tick_at = Some(at);
        health.last_error = Some(error.to_string());
        health.last_error_at = Some(at);
        health.consecutive_errors += 1;
        metrics::counter!("outreach.loop_errors", "loop" => kind.as_str()).increment(1);
    }

    pub fn loop_health(&self, kind: LoopKind) -> LoopHealth {
        self.health(kind).lock().clone()
    }

    pub fn snapshot(&self) -> CampaignStats {
        use Counter::*;
        CampaignStats {
            leads_discovered: self.get(LeadsDiscovered),
            leads_qualified: self.get(LeadsQualified),
            leads_manual: self.get(LeadsManual),
            sequences_started: self.get(SequencesStarted),
            sequences_completed: self.get(SequencesCompleted),
            sequences_paused: self.get(SequencesPaused),
            sequences_stopped: self.get(SequencesStopped),
            sequences_switched: self.get(SequencesSwitched),
            sequences_reactivated: self.get(SequencesReactivated),
            messages_sent: self.get(MessagesSent),
            delivery_failures: self.get(DeliveryFailures),
            opens: self.get(Opens),
            clicks: self.get(Clicks),
            replies: self.get(Replies),
            unsubscribes: self.get(Unsubscribes),
            bounces: self.get(Bounces),
            auto_replies_sent: self.get(AutoRepliesSent),
            duplicate_calls_suppressed: self.get(DuplicateCallsSuppressed),
            stale_results_discarded: self.get(StaleResultsDiscarded),
            discovery: self.loop_health(LoopKind::Discovery),
            dispatch: self.loop_health(LoopKind::Dispatch),
            interaction_poll: self.loop_health(LoopKind::InteractionPoll),
        }
    }
}

impl Default for StatsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_land_in_their_fields() {
        let stats = StatsRecorder::new();
        stats.incr(Counter::MessagesSent);
        stats.add(Counter::MessagesSent, 2);
        stats.incr(Counter::StaleResultsDiscarded);
        let snap = stats.snapshot();
        assert_eq!(snap.messages_sent, 3);
        assert_eq!(snap.stale_results_discarded, 1);
        assert_eq!(snap.leads_discovered, 0);
    }

    #[test]
    fn test_loop_health_tracks_latest_error() {
        let stats = StatsRecorder::new();
        let now = Utc::now();
        stats.tick_failed(LoopKind::Dispatch, now, "smtp unreachable");
        stats.tick_failed(LoopKind::Dispatch, now, "smtp still unreachable");
        let health = stats.loop_health(LoopKind::Dispatch);
        assert_eq!(health.consecutive_errors, 2);
        assert_eq!(health.last_error.as_deref(), Some("smtp still unreachable"));

        stats.tick_ok(LoopKind::Dispatch, now);
        let health = stats.loop_health(LoopKind::Dispatch);
        assert_eq!(health.ticks, 3);
        assert_eq!(health.consecutive_errors, 0);
        // Last error stays visible after recovery.
        assert!(health.last_error.is_some());
        assert_eq!(stats.loop_health(LoopKind::Discovery).ticks, 0);
    }
}
