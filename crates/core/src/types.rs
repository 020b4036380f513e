use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::CampaignConfig;

/// Dispatch priority of a lead. Ordering is `Low < Medium < High`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// Maps a discovery score in `[0, 1]` onto a priority band.
    pub fn from_score(score: f32) -> Self {
        if score >= 0.7 {
            Priority::High
        } else if score >= 0.4 {
            Priority::Medium
        } else {
            Priority::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    Discovered,
    Ready,
    Sequencing,
    Replied,
    Bounced,
    Unsubscribed,
}

impl LeadStatus {
    /// Leads in these states must never be contacted again by automation.
    pub fn is_suppressed(&self) -> bool {
        matches!(self, LeadStatus::Bounced | LeadStatus::Unsubscribed)
    }
}

/// Where a lead came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum LeadSource {
    Discovery(String),
    Manual,
    Restored,
}

/// A contact enrolled (or about to be enrolled) in outreach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    /// Normalized contact identifier (unique across the campaign).
    pub contact: String,
    pub name: Option<String>,
    pub company: Option<String>,
    pub source: LeadSource,
    pub priority: Priority,
    pub status: LeadStatus,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_failure_reason: Option<String>,
}

impl Lead {
    pub fn new(contact: String, source: LeadSource, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            contact,
            name: None,
            company: None,
            source,
            priority,
            status: LeadStatus::Discovered,
            attributes: HashMap::new(),
            created_at: now,
            updated_at: now,
            last_failure_reason: None,
        }
    }
}

/// Normalizes a contact identifier for uniqueness checks.
pub fn normalize_contact(contact: &str) -> String {
    contact.trim().to_lowercase()
}

/// A contact is usable if it is non-empty and carries no inner whitespace.
pub fn is_usable_contact(contact: &str) -> bool {
    let trimmed = contact.trim();
    !trimmed.is_empty() && !trimmed.chars().any(char::is_whitespace)
}

/// Kind of recipient behavior observed for a sequence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    Sent,
    Opened,
    Clicked,
    Replied,
    Unsubscribed,
    Bounced,
}

impl InteractionType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sent" | "delivered" => Some(InteractionType::Sent),
            "opened" | "open" => Some(InteractionType::Opened),
            "clicked" | "click" => Some(InteractionType::Clicked),
            "replied" | "reply" => Some(InteractionType::Replied),
            "unsubscribed" | "unsubscribe" => Some(InteractionType::Unsubscribed),
            "bounced" | "bounce" => Some(InteractionType::Bounced),
            _ => None,
        }
    }

    /// Opens, clicks and replies count as engagement.
    pub fn is_engagement(&self) -> bool {
        matches!(
            self,
            InteractionType::Opened | InteractionType::Clicked | InteractionType::Replied
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InteractionEvent {
    /// Stable identifier used for idempotent application.
    pub id: String,
    pub lead_id: Uuid,
    pub sequence_id: Uuid,
    pub kind: InteractionType,
    pub step_index: Option<usize>,
    pub timestamp: DateTime<Utc>,
}

/// Explicit interaction context used when choosing a template.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InteractionHint {
    ColdContact,
    DemoInterest,
    PostMeeting,
}

/// Lead record as returned by a discovery provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawLead {
    pub contact: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub score: Option<f32>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// Behavioral record as returned by an engagement provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub id: Option<String>,
    pub contact: String,
    #[serde(default)]
    pub sequence_id: Option<Uuid>,
    pub kind: String,
    #[serde(default)]
    pub step_index: Option<usize>,
    pub occurred_at: DateTime<Utc>,
}

/// Generated message content.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageContent {
    pub subject: String,
    pub body: String,
}

/// Delivery acknowledgement from the mail provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub message_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// Operator-supplied lead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManualLead {
    pub contact: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub interaction: Option<InteractionHint>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Stopped,
}

/// One start/stop cycle of the campaign engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRun {
    pub id: Uuid,
    pub config: CampaignConfig,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stats: CampaignStats,
}

/// Health of a single scheduler loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopHealth {
    pub ticks: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub consecutive_errors: u64,
}

/// Point-in-time copy of the aggregate counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignStats {
    pub leads_discovered: u64,
    pub leads_qualified: u64,
    pub leads_manual: u64,
    pub sequences_started: u64,
    pub sequences_completed: u64,
    pub sequences_paused: u64,
    pub sequences_stopped: u64,
    pub sequences_switched: u64,
    pub sequences_reactivated: u64,
    pub messages_sent: u64,
    pub delivery_failures: u64,
    pub opens: u64,
    pub clicks: u64,
    pub replies: u64,
    pub unsubscribes: u64,
    pub bounces: u64,
    pub auto_replies_sent: u64,
    pub duplicate_calls_suppressed: u64,
    pub stale_results_discarded: u64,
    pub discovery: LoopHealth,
    pub dispatch: LoopHealth,
    pub interaction_poll: LoopHealth,
}

/// Analytics event emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub lead_id: Option<Uuid>,
    pub sequence_id: Option<Uuid>,
    pub detail: Option<String>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CampaignStarted,
    CampaignStopped,
    LeadDiscovered,
    LeadAdded,
    SequenceStarted,
    StepSent,
    DeliveryFailed,
    SequencePaused,
    SequenceStopped,
    SequenceCompleted,
    SequenceSwitched,
    SequenceReactivated,
    InteractionRecorded,
    AutoReplySent,
}
