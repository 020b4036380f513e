use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::schedule::SendTimePlanner;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::SequenceCatalog;
use crate::types::{PauseReason, SequenceInstance, SequenceStatus, StopReason};

/// Describes a single valid state transition for a sequence instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SequenceStatus,
    pub to: SequenceStatus,
    pub trigger: String,
}

/// Commands that may move a sequence instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceCommand {
    /// Step `step_index` was delivered.
    DispatchSucceeded { step_index: usize },
    /// A dispatch attempt failed without a hard bounce.
    DispatchFailed { reason: String },
    Pause(PauseReason),
    Stop(StopReason),
    /// Restart on another template from step 0.
    SwitchSequence { template_id: String },
}

impl SequenceCommand {
    pub fn name(&self) -> &'static str {
        match self {
            SequenceCommand::DispatchSucceeded { .. } => "dispatch_succeeded",
            SequenceCommand::DispatchFailed { .. } => "dispatch_failed",
            SequenceCommand::Pause(_) => "pause",
            SequenceCommand::Stop(_) => "stop",
            SequenceCommand::SwitchSequence { .. } => "switch_sequence",
        }
    }
}

/// What a successfully applied command did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Advanced { next_step: usize, next_due_at: DateTime<Utc> },
    Completed,
    FailureRecorded { consecutive: u32 },
    Paused(PauseReason),
    Stopped(StopReason),
    Switched { from: String, to: String },
}

/// Everything a transition needs besides the instance itself.
pub struct TransitionContext<'a> {
    pub catalog: &'a SequenceCatalog,
    pub planner: &'a dyn SendTimePlanner,
    pub now: DateTime<Utc>,
    /// Consecutive dispatch failures tolerated before the instance stops.
    pub failure_budget: u32,
}

/// Guards sequence-instance lifecycle by enforcing a finite set of valid
/// state transitions. Rejected commands leave the instance untouched.
#[derive(Debug, Clone)]
pub struct SequenceStateMachine {
    pub transitions: Vec<StateTransition>,
}

impl SequenceStateMachine {
    pub fn new() -> Self {
        let t = |from, to, trigger: &str| StateTransition {
            from,
            to,
            trigger: trigger.to_string(),
        };
        let transitions = vec![
            // Active ->
            t(SequenceStatus::Active, SequenceStatus::Active, "step_dispatched"),
            t(SequenceStatus::Active, SequenceStatus::Active, "switch_sequence"),
            t(SequenceStatus::Active, SequenceStatus::Completed, "final_step_dispatched"),
            t(SequenceStatus::Active, SequenceStatus::Paused, "replied"),
            t(SequenceStatus::Active, SequenceStatus::Stopped, "stop"),
            // Paused ->
            t(SequenceStatus::Paused, SequenceStatus::Active, "switch_sequence"),
            t(SequenceStatus::Paused, SequenceStatus::Stopped, "stop"),
        ];
        Self { transitions }
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(&self, from: &SequenceStatus, to: &SequenceStatus) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.to == *to)
    }

    /// Applies `command` to `instance`.
    ///
    /// Returns `ConcurrencyViolation` (and changes nothing) when the command
    /// is not valid for the instance's current status, or when a dispatch
    /// result refers to a step the instance is no longer on.
    pub fn apply(
        &self,
        instance: &mut SequenceInstance,
        command: SequenceCommand,
        ctx: &TransitionContext<'_>,
    ) -> CampaignResult<TransitionOutcome> {
        let violation = |instance: &SequenceInstance, command: &SequenceCommand| {
            CampaignError::ConcurrencyViolation {
                instance_id: instance.id,
                status: instance.status.as_str().to_string(),
                action: command.name().to_string(),
            }
        };

        let target = match &command {
            SequenceCommand::DispatchSucceeded { step_index } => {
                if *step_index != instance.current_step_index {
                    return Err(violation(instance, &command));
                }
                let template = ctx.catalog.resolve(&instance.template_id)?;
                if step_index + 1 >= template.len() {
                    SequenceStatus::Completed
                } else {
                    SequenceStatus::Active
                }
            }
            SequenceCommand::DispatchFailed { .. } => SequenceStatus::Active,
            SequenceCommand::Pause(_) => SequenceStatus::Paused,
            SequenceCommand::Stop(_) => SequenceStatus::Stopped,
            SequenceCommand::SwitchSequence { .. } => SequenceStatus::Active,
        };

        if !self.can_transition(&instance.status, &target) {
            return Err(violation(instance, &command));
        }
        // From Paused only a switch or a stop is accepted.
        if instance.status == SequenceStatus::Paused
            && !matches!(command, SequenceCommand::SwitchSequence { .. } | SequenceCommand::Stop(_))
        {
            return Err(violation(instance, &command));
        }

        let now = ctx.now;
        let outcome = match command {
            SequenceCommand::DispatchSucceeded { step_index } => {
                let template = ctx.catalog.resolve(&instance.template_id)?;
                let next_step = step_index + 1;
                instance.current_step_index = next_step;
                instance.counters.sent += 1;
                instance.consecutive_failures = 0;
                instance.last_failure = None;
                instance.last_step_sent_at = Some(now);

                if next_step >= template.len() {
                    instance.status = SequenceStatus::Completed;
                    instance.next_due_at = None;
                    instance.ended_at = Some(now);
                    info!(instance_id = %instance.id, template_id = %instance.template_id, "Sequence completed");
                    TransitionOutcome::Completed
                } else {
                    let earliest = instance
                        .earliest_for_step(template, next_step)
                        .map_or(now, |at| at.max(now));
                    let next_due_at = ctx.planner.plan(earliest);
                    instance.next_due_at = Some(next_due_at);
                    debug!(
                        instance_id = %instance.id,
                        next_step,
                        next_due_at = %next_due_at,
                        "Sequence advanced"
                    );
                    TransitionOutcome::Advanced {
                        next_step,
                        next_due_at,
                    }
                }
            }
            SequenceCommand::DispatchFailed { reason } => {
                instance.consecutive_failures += 1;
                instance.last_failure = Some(reason);
                if instance.consecutive_failures >= ctx.failure_budget {
                    stop(instance, StopReason::SendFailed, now);
                    TransitionOutcome::Stopped(StopReason::SendFailed)
                } else {
                    TransitionOutcome::FailureRecorded {
                        consecutive: instance.consecutive_failures,
                    }
                }
            }
            SequenceCommand::Pause(reason) => {
                instance.status = SequenceStatus::Paused;
                instance.pause_reason = Some(reason);
                instance.next_due_at = None;
                info!(instance_id = %instance.id, ?reason, "Sequence paused");
                TransitionOutcome::Paused(reason)
            }
            SequenceCommand::Stop(reason) => {
                stop(instance, reason, now);
                TransitionOutcome::Stopped(reason)
            }
            SequenceCommand::SwitchSequence { template_id } => {
                let template = ctx.catalog.resolve(&template_id)?;
                let from = std::mem::replace(&mut instance.template_id, template.id.clone());
                instance.generation += 1;
                instance.current_step_index = 0;
                instance.status = SequenceStatus::Active;
                instance.pause_reason = None;
                instance.consecutive_failures = 0;
                instance.last_failure = None;
                instance.started_at = now;
                let earliest = instance.earliest_for_step(template, 0).unwrap_or(now);
                instance.next_due_at = Some(ctx.planner.plan(earliest));
                info!(instance_id = %instance.id, from = %from, to = %template_id, "Sequence switched");
                TransitionOutcome::Switched {
                    from,
                    to: template_id,
                }
            }
        };

        instance.updated_at = now;
        Ok(outcome)
    }
}

fn stop(instance: &mut SequenceInstance, reason: StopReason, now: DateTime<Utc>) {
    instance.status = SequenceStatus::Stopped;
    instance.stop_reason = Some(reason);
    instance.next_due_at = None;
    instance.ended_at = Some(now);
    info!(instance_id = %instance.id, ?reason, "Sequence stopped");
}

impl Default for SequenceStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{COLD_OUTREACH, HIGH_INTENT};
    use crate::types::SequenceTemplate;
    use campaign_core::schedule::Immediate;
    use chrono::Duration;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn setup() -> (SequenceCatalog, SequenceInstance, DateTime<Utc>) {
        let catalog = SequenceCatalog::with_defaults();
        let now = Utc::now();
        let template: SequenceTemplate = catalog.resolve(COLD_OUTREACH).unwrap().clone();
        let inst = SequenceInstance::start(Uuid::new_v4(), &template, HashMap::new(), now, now);
        (catalog, inst, now)
    }

    fn ctx(catalog: &SequenceCatalog, now: DateTime<Utc>) -> TransitionContext<'_> {
        TransitionContext {
            catalog,
            planner: &Immediate,
            now,
            failure_budget: 3,
        }
    }

    #[test]
    fn test_dispatch_advances_and_plans_next_offset() {
        let (catalog, mut inst, now) = setup();
        let sm = SequenceStateMachine::new();

        let outcome = sm
            .apply(&mut inst, SequenceCommand::DispatchSucceeded { step_index: 0 }, &ctx(&catalog, now))
            .unwrap();

        assert_eq!(
            outcome,
            TransitionOutcome::Advanced {
                next_step: 1,
                next_due_at: now + Duration::days(3)
            }
        );
        assert_eq!(inst.current_step_index, 1);
        assert_eq!(inst.counters.sent, 1);
    }

    #[test]
    fn test_final_step_completes() {
        let (catalog, mut inst, now) = setup();
        let sm = SequenceStateMachine::new();
        for i in 0..7 {
            sm.apply(&mut inst, SequenceCommand::DispatchSucceeded { step_index: i }, &ctx(&catalog, now))
                .unwrap();
        }
        assert_eq!(inst.status, SequenceStatus::Completed);
        assert_eq!(inst.current_step_index, 7);
        assert!(inst.next_due_at.is_none());

        // Terminal: nothing moves it any more.
        let err = sm
            .apply(&mut inst, SequenceCommand::Stop(StopReason::OperatorCancel), &ctx(&catalog, now))
            .unwrap_err();
        assert!(matches!(err, CampaignError::ConcurrencyViolation { .. }));
        assert_eq!(inst.status, SequenceStatus::Completed);
        assert_eq!(inst.current_step_index, 7);
    }

    #[test]
    fn test_stale_dispatch_result_rejected() {
        let (catalog, mut inst, now) = setup();
        let sm = SequenceStateMachine::new();
        sm.apply(&mut inst, SequenceCommand::DispatchSucceeded { step_index: 0 }, &ctx(&catalog, now))
            .unwrap();
        let err = sm
            .apply(&mut inst, SequenceCommand::DispatchSucceeded { step_index: 0 }, &ctx(&catalog, now))
            .unwrap_err();
        assert!(matches!(err, CampaignError::ConcurrencyViolation { .. }));
        assert_eq!(inst.current_step_index, 1);
    }

    #[test]
    fn test_failure_budget_stops_without_advancing() {
        let (catalog, mut inst, now) = setup();
        let sm = SequenceStateMachine::new();
        sm.apply(&mut inst, SequenceCommand::DispatchSucceeded { step_index: 0 }, &ctx(&catalog, now))
            .unwrap();

        for expected in 1..3 {
            let outcome = sm
                .apply(
                    &mut inst,
                    SequenceCommand::DispatchFailed { reason: "smtp timeout".into() },
                    &ctx(&catalog, now),
                )
                .unwrap();
            assert_eq!(outcome, TransitionOutcome::FailureRecorded { consecutive: expected });
        }
        let outcome = sm
            .apply(
                &mut inst,
                SequenceCommand::DispatchFailed { reason: "smtp timeout".into() },
                &ctx(&catalog, now),
            )
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Stopped(StopReason::SendFailed));
        assert_eq!(inst.current_step_index, 1);
        assert_eq!(inst.stop_reason, Some(StopReason::SendFailed));
        assert_eq!(inst.last_failure.as_deref(), Some("smtp timeout"));
    }

    #[test]
    fn test_pause_then_switch_resumes_from_zero() {
        let (catalog, mut inst, now) = setup();
        let sm = SequenceStateMachine::new();
        sm.apply(&mut inst, SequenceCommand::DispatchSucceeded { step_index: 0 }, &ctx(&catalog, now))
            .unwrap();
        sm.apply(&mut inst, SequenceCommand::Pause(PauseReason::HumanTakeover), &ctx(&catalog, now))
            .unwrap();
        assert_eq!(inst.status, SequenceStatus::Paused);
        assert_eq!(inst.current_step_index, 1);
        assert!(inst.next_due_at.is_none());

        // Paused instances do not accept dispatch results.
        assert!(sm
            .apply(&mut inst, SequenceCommand::DispatchSucceeded { step_index: 1 }, &ctx(&catalog, now))
            .is_err());

        let later = now + Duration::days(2);
        let outcome = sm
            .apply(
                &mut inst,
                SequenceCommand::SwitchSequence { template_id: HIGH_INTENT.into() },
                &ctx(&catalog, later),
            )
            .unwrap();
        assert!(matches!(outcome, TransitionOutcome::Switched { .. }));
        assert_eq!(inst.status, SequenceStatus::Active);
        assert_eq!(inst.template_id, HIGH_INTENT);
        assert_eq!(inst.current_step_index, 0);
        assert_eq!(inst.generation, 1);
        assert_eq!(inst.next_due_at, Some(later));
    }

    #[test]
    fn test_switch_to_unknown_template_changes_nothing() {
        let (catalog, mut inst, now) = setup();
        let sm = SequenceStateMachine::new();
        let err = sm
            .apply(
                &mut inst,
                SequenceCommand::SwitchSequence { template_id: "nope".into() },
                &ctx(&catalog, now),
            )
            .unwrap_err();
        assert!(matches!(err, CampaignError::NotFound { .. }));
        assert_eq!(inst.template_id, COLD_OUTREACH);
        assert_eq!(inst.generation, 0);
    }

    #[test]
    fn test_transition_table() {
        let sm = SequenceStateMachine::new();
        assert!(sm.can_transition(&SequenceStatus::Active, &SequenceStatus::Paused));
        assert!(sm.can_transition(&SequenceStatus::Paused, &SequenceStatus::Active));
        assert!(!sm.can_transition(&SequenceStatus::Stopped, &SequenceStatus::Active));
        assert!(!sm.can_transition(&SequenceStatus::Completed, &SequenceStatus::Stopped));
        assert!(!sm.can_transition(&SequenceStatus::Paused, &SequenceStatus::Completed));
    }
}
