use std::collections::{HashMap, HashSet};

use campaign_core::types::Priority;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a step is meant to accomplish. Passed to the personalization provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPurpose {
    Introduction,
    ValueProposition,
    SocialProof,
    CaseStudy,
    FollowUp,
    DemoInvite,
    MeetingRecap,
    ResourceShare,
    CheckIn,
    Reengagement,
    Breakup,
    ReplyAcknowledgement,
}

/// A single timed message in a sequence template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Days after the sequence start at which this step becomes due.
    pub offset_days: u32,
    pub purpose: StepPurpose,
    pub priority_hint: Priority,
}

impl Step {
    pub fn new(offset_days: u32, purpose: StepPurpose, priority_hint: Priority) -> Self {
        Self {
            offset_days,
            purpose,
            priority_hint,
        }
    }
}

/// A named, ordered list of timed outreach steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceTemplate {
    pub id: String,
    pub name: String,
    pub description: String,
    pub steps: Vec<Step>,
}

impl SequenceTemplate {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    /// Offset of step `index` from the sequence start.
    pub fn offset(&self, index: usize) -> Option<Duration> {
        self.steps
            .get(index)
            .map(|s| Duration::days(i64::from(s.offset_days)))
    }
}

/// Runtime status of a sequence instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    Active,
    Paused,
    Stopped,
    Completed,
}

impl SequenceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SequenceStatus::Stopped | SequenceStatus::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SequenceStatus::Active => "active",
            SequenceStatus::Paused => "paused",
            SequenceStatus::Stopped => "stopped",
            SequenceStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Unsubscribed,
    Bounced,
    SendFailed,
    OperatorCancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    HumanTakeover,
}

/// Per-instance engagement counters. `replied <= sent` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub sent: u64,
    pub opened: u64,
    pub clicked: u64,
    pub replied: u64,
}

/// One lead's live progression through a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceInstance {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub template_id: String,
    pub current_step_index: usize,
    /// Incremented on every template switch. `(generation, current_step_index)`
    /// never decreases.
    pub generation: u32,
    pub status: SequenceStatus,
    pub started_at: DateTime<Utc>,
    /// Set only while `Active`.
    pub next_due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub context: HashMap<String, String>,
    #[serde(default)]
    pub counters: Counters,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_failure: Option<String>,
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
    #[serde(default)]
    pub pause_reason: Option<PauseReason>,
    #[serde(default)]
    pub intent_upgraded: bool,
    #[serde(default)]
    pub processed_events: HashSet<String>,
    #[serde(default)]
    pub last_step_sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_engagement_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub successor_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Busy flag set while an external call for this instance is outstanding.
    #[serde(skip)]
    pub in_flight: bool,
}

impl SequenceInstance {
    /// Creates an active instance positioned at step 0 of `template`.
    pub fn start(
        lead_id: Uuid,
        template: &SequenceTemplate,
        context: HashMap<String, String>,
        started_at: DateTime<Utc>,
        next_due_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id,
            template_id: template.id.clone(),
            current_step_index: 0,
            generation: 0,
            status: SequenceStatus::Active,
            started_at,
            next_due_at: Some(next_due_at),
            context,
            counters: Counters::default(),
            consecutive_failures: 0,
            last_failure: None,
            stop_reason: None,
            pause_reason: None,
            intent_upgraded: false,
            processed_events: HashSet::new(),
            last_step_sent_at: None,
            last_engagement_at: None,
            successor_id: None,
            updated_at: started_at,
            ended_at: None,
            in_flight: false,
        }
    }

    /// Earliest moment step `index` of `template` may be sent for this instance.
    pub fn earliest_for_step(
        &self,
        template: &SequenceTemplate,
        index: usize,
    ) -> Option<DateTime<Utc>> {
        template.offset(index).map(|offset| self.started_at + offset)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == SequenceStatus::Active
            && !self.in_flight
            && self.next_due_at.is_some_and(|due| due <= now)
    }
}
