//! Trigger routing: maps observed recipient behavior onto sequence actions.

use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::types::{InteractionEvent, InteractionType};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::{SequenceCatalog, HIGH_INTENT, REACTIVATION};
use crate::state_machine::{
    SequenceCommand, SequenceStateMachine, TransitionContext, TransitionOutcome,
};
use crate::types::{PauseReason, SequenceInstance, SequenceStatus, StopReason};

/// What an event asks the state machine to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ActionDecision {
    None,
    Pause { reason: PauseReason },
    Stop { reason: StopReason },
    SwitchSequence { template_id: String },
}

impl ActionDecision {
    pub fn into_command(self) -> Option<SequenceCommand> {
        match self {
            ActionDecision::None => None,
            ActionDecision::Pause { reason } => Some(SequenceCommand::Pause(reason)),
            ActionDecision::Stop { reason } => Some(SequenceCommand::Stop(reason)),
            ActionDecision::SwitchSequence { template_id } => {
                Some(SequenceCommand::SwitchSequence { template_id })
            }
        }
    }
}

/// Result of feeding one event into an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Event id already applied to this instance; nothing changed.
    Duplicate,
    /// Bookkeeping recorded and the decision (if any) applied.
    Applied {
        decision: ActionDecision,
        transition: Option<TransitionOutcome>,
    },
    /// Bookkeeping recorded but the decision could not be applied.
    Rejected {
        decision: ActionDecision,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct TriggerRouter {
    high_intent_template: String,
    reactivation_template: String,
    cooldown: Duration,
}

impl TriggerRouter {
    /// Router using the built-in high-intent and reactivation templates.
    pub fn new(catalog: &SequenceCatalog, cooldown_days: i64) -> CampaignResult<Self> {
        Self::with_templates(catalog, HIGH_INTENT, REACTIVATION, cooldown_days)
    }

    pub fn with_templates(
        catalog: &SequenceCatalog,
        high_intent_template: &str,
        reactivation_template: &str,
        cooldown_days: i64,
    ) -> CampaignResult<Self> {
        catalog.resolve(high_intent_template)?;
        catalog.resolve(reactivation_template)?;
        let cooldown = (cooldown_days >= 0)
            .then(|| Duration::try_days(cooldown_days))
            .flatten()
            .ok_or_else(|| {
                CampaignError::Config(format!("reactivation cooldown of {cooldown_days} days is out of range"))
            })?;
        Ok(Self {
            high_intent_template: high_intent_template.to_string(),
            reactivation_template: reactivation_template.to_string(),
            cooldown,
        })
    }

    /// Pure mapping from an event to the action it implies for `instance`.
    pub fn route(&self, event: &InteractionEvent, instance: &SequenceInstance) -> ActionDecision {
        match event.kind {
            InteractionType::Sent | InteractionType::Opened => ActionDecision::None,
            InteractionType::Clicked => {
                if instance.status == SequenceStatus::Active
                    && !instance.intent_upgraded
                    && instance.template_id != self.high_intent_template
                {
                    ActionDecision::SwitchSequence {
                        template_id: self.high_intent_template.clone(),
                    }
                } else {
                    ActionDecision::None
                }
            }
            InteractionType::Replied => ActionDecision::Pause {
                reason: PauseReason::HumanTakeover,
            },
            InteractionType::Unsubscribed => ActionDecision::Stop {
                reason: StopReason::Unsubscribed,
            },
            InteractionType::Bounced => ActionDecision::Stop {
                reason: StopReason::Bounced,
            },
        }
    }

    /// Decides whether a finished sequence has gone quiet long enough to be
    /// reactivated.
    pub fn evaluate_dormant(&self, instance: &SequenceInstance, now: DateTime<Utc>) -> ActionDecision {
        if instance.status != SequenceStatus::Completed
            || instance.successor_id.is_some()
            || instance.template_id == self.reactivation_template
        {
            return ActionDecision::None;
        }
        let Some(final_sent) = instance.last_step_sent_at else {
            return ActionDecision::None;
        };
        let engaged_since = instance
            .last_engagement_at
            .is_some_and(|at| at >= final_sent);
        if engaged_since || now - final_sent < self.cooldown {
            return ActionDecision::None;
        }
        ActionDecision::SwitchSequence {
            template_id: self.reactivation_template.clone(),
        }
    }

    /// Applies `event` to `instance` at most once.
    ///
    /// Engagement bookkeeping is recorded regardless of status; the routed
    /// decision goes through the state machine and is dropped with a warning
    /// when the instance can no longer take it.
    pub fn ingest(
        &self,
        instance: &mut SequenceInstance,
        event: &InteractionEvent,
        machine: &SequenceStateMachine,
        ctx: &TransitionContext<'_>,
    ) -> IngestOutcome {
        if instance.processed_events.contains(&event.id) {
            debug!(event_id = %event.id, instance_id = %instance.id, "Duplicate interaction ignored");
            return IngestOutcome::Duplicate;
        }

        let decision = self.route(event, instance);

        instance.processed_events.insert(event.id.clone());
        record_engagement(instance, event);
        instance.updated_at = ctx.now;

        let Some(command) = decision.clone().into_command() else {
            return IngestOutcome::Applied {
                decision,
                transition: None,
            };
        };

        let upgrading = matches!(
            &decision,
            ActionDecision::SwitchSequence { template_id } if *template_id == self.high_intent_template
        );

        match machine.apply(instance, command, ctx) {
            Ok(transition) => {
                if upgrading {
                    instance.intent_upgraded = true;
                }
                IngestOutcome::Applied {
                    decision,
                    transition: Some(transition),
                }
            }
            Err(e) => {
                warn!(
                    instance_id = %instance.id,
                    event_id = %event.id,
                    kind = ?event.kind,
                    error = %e,
                    "Trigger ignored"
                );
                IngestOutcome::Rejected {
                    decision,
                    reason: e.to_string(),
                }
            }
        }
    }
}

fn record_engagement(instance: &mut SequenceInstance, event: &InteractionEvent) {
    match event.kind {
        InteractionType::Opened => instance.counters.opened += 1,
        InteractionType::Clicked => instance.counters.clicked += 1,
        InteractionType::Replied => {
            if instance.counters.replied < instance.counters.sent {
                instance.counters.replied += 1;
            }
        }
        InteractionType::Sent | InteractionType::Unsubscribed | InteractionType::Bounced => {}
    }
    if event.kind.is_engagement() {
        let latest = instance
            .last_engagement_at
            .map_or(event.timestamp, |at| at.max(event.timestamp));
        instance.last_engagement_at = Some(latest);
    }
}
