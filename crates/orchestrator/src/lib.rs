//! Campaign orchestration: the lead and sequence ledger, the concurrency
//! guard, the three scheduler loops, and the controller that owns a run.

pub mod controller;
pub mod guard;
pub mod ledger;
pub mod local;
pub mod providers;
pub mod scheduler;
pub mod stats;
pub mod store;

pub use controller::{CampaignController, InstanceCounts, LeadReport, StatusReport};
pub use guard::{ConcurrencyGuard, GuardKey, Guarded};
pub use ledger::{DispatchClaim, HydrationReport, Ledger};
pub use local::local_providers;
pub use providers::{
    EngagementProvider, LeadDiscoveryProvider, MailDeliveryProvider, PersonalizationProvider,
    Providers,
};
pub use scheduler::{DiscoveryReport, DispatchBatch, DispatchOutcome, DispatchReport, PollReport, Scheduler};
pub use stats::{LoopKind, StatsRecorder};
pub use store::{InMemoryStore, PersistenceStore};
