//! Sequence templates, the per-lead sequence state machine, and the trigger
//! router that turns recipient behavior into state-machine commands.

pub mod catalog;
pub mod state_machine;
pub mod trigger;
pub mod types;

pub use catalog::{SelectionContext, SequenceCatalog};
pub use state_machine::{SequenceCommand, SequenceStateMachine, TransitionContext, TransitionOutcome};
pub use trigger::{ActionDecision, IngestOutcome, TriggerRouter};
pub use types::{
    PauseReason, SequenceInstance, SequenceStatus, SequenceTemplate, Step, StepPurpose, StopReason,
};
