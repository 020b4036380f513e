//! Campaign controller: owns the run lifecycle, the ledger and the guard.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use campaign_core::config::CampaignConfig;
use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::event_bus::{EventSink, NoOpSink};
use campaign_core::types::{
    is_usable_contact, normalize_contact, AnalyticsEvent, CampaignRun, CampaignStats, EventType, InteractionHint,
    Lead, LeadSource, LeadStatus, ManualLead, Priority, RunStatus,
};
use campaign_sequence::{
    SelectionContext, SequenceCatalog, SequenceCommand, SequenceInstance, SequenceStateMachine,
    SequenceStatus, StopReason, TransitionContext, TransitionOutcome,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::guard::ConcurrencyGuard;
use crate::ledger::Ledger;
use crate::providers::Providers;
use crate::scheduler::{DiscoveryReport, DispatchBatch, DispatchReport, PollReport, RunState, Scheduler};
use crate::stats::{Counter, StatsRecorder};
use crate::store::PersistenceStore;

/// A lead together with its current sequence.
#[derive(Debug, Clone, Serialize)]
pub struct LeadReport {
    pub lead: Lead,
    pub instance: Option<SequenceInstance>,
    pub last_failure: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InstanceCounts {
    pub active: usize,
    pub paused: usize,
    pub stopped: usize,
    pub completed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub run: Option<CampaignRun>,
    pub auto_reply_enabled: bool,
    pub leads: usize,
    pub instances: InstanceCounts,
    pub in_flight_keys: Vec<String>,
    pub stats: CampaignStats,
}

struct ActiveRun {
    run: CampaignRun,
    shutdown: watch::Sender<bool>,
    // Dropping detaches the loops; they exit on the shutdown signal.
    _loops: Vec<JoinHandle<()>>,
}

/// Sole owner of sequence lifecycle. The store is only a mirror.
pub struct CampaignController {
    providers: Providers,
    catalog: Arc<SequenceCatalog>,
    ledger: Arc<Ledger>,
    guard: Arc<ConcurrencyGuard>,
    stats: Arc<StatsRecorder>,
    sink: Arc<dyn EventSink>,
    run_state: Arc<RunState>,
    auto_reply: Arc<AtomicBool>,
    machine: SequenceStateMachine,
    scheduler: RwLock<Arc<Scheduler>>,
    active: Mutex<Option<ActiveRun>>,
}

impl CampaignController {
    pub fn new(
        config: CampaignConfig,
        providers: Providers,
        store: Arc<dyn PersistenceStore>,
    ) -> CampaignResult<Self> {
        Self::with_parts(
            config,
            providers,
            store,
            SequenceCatalog::with_defaults(),
            Arc::new(NoOpSink),
        )
    }

    pub fn with_parts(
        config: CampaignConfig,
        providers: Providers,
        store: Arc<dyn PersistenceStore>,
        catalog: SequenceCatalog,
        sink: Arc<dyn EventSink>,
    ) -> CampaignResult<Self> {
        config.validate()?;
        let catalog = Arc::new(catalog);
        let ledger = Arc::new(Ledger::new(store));
        let guard = Arc::new(ConcurrencyGuard::new(StdDuration::from_millis(config.dedup_wait_ms)));
        let stats = Arc::new(StatsRecorder::new());
        let run_state = Arc::new(RunState::new());
        let auto_reply = Arc::new(AtomicBool::new(config.auto_reply_enabled));

        let scheduler = Arc::new(Scheduler::new(
            config,
            Arc::clone(&ledger),
            Arc::clone(&guard),
            Arc::clone(&catalog),
            providers.clone(),
            Arc::clone(&stats),
            Arc::clone(&sink),
            Arc::clone(&run_state),
            Arc::clone(&auto_reply),
        )?);

        Ok(Self {
            providers,
            catalog,
            ledger,
            guard,
            stats,
            sink,
            run_state,
            auto_reply,
            machine: SequenceStateMachine::new(),
            scheduler: RwLock::new(scheduler),
            active: Mutex::new(None),
        })
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.read().clone()
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn guard(&self) -> &Arc<ConcurrencyGuard> {
        &self.guard
    }

    pub fn catalog(&self) -> &Arc<SequenceCatalog> {
        &self.catalog
    }

    pub fn config(&self) -> CampaignConfig {
        self.scheduler().config().clone()
    }

    pub fn is_running(&self) -> bool {
        self.run_state.is_running()
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Starts a run and spawns the three scheduler loops.
    pub fn start(&self, config: CampaignConfig) -> CampaignResult<CampaignRun> {
        self.begin_run(config, true)
    }

    /// Starts a run whose ticks are driven by the caller through
    /// [`discovery_tick`](Self::discovery_tick),
    /// [`dispatch_tick`](Self::dispatch_tick) and [`poll_tick`](Self::poll_tick).
    pub fn start_without_loops(&self, config: CampaignConfig) -> CampaignResult<CampaignRun> {
        self.begin_run(config, false)
    }

    fn begin_run(&self, config: CampaignConfig, spawn_loops: bool) -> CampaignResult<CampaignRun> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(CampaignError::AlreadyRunning);
        }
        config.validate()?;

        let hydrated = self.ledger.hydrate()?;
        self.guard
            .set_wait_bound(StdDuration::from_millis(config.dedup_wait_ms));
        let scheduler = Arc::new(Scheduler::new(
            config.clone(),
            Arc::clone(&self.ledger),
            Arc::clone(&self.guard),
            Arc::clone(&self.catalog),
            self.providers.clone(),
            Arc::clone(&self.stats),
            Arc::clone(&self.sink),
            Arc::clone(&self.run_state),
            Arc::clone(&self.auto_reply),
        )?);
        *self.scheduler.write() = Arc::clone(&scheduler);

        self.run_state.begin();
        let run = CampaignRun {
            id: Uuid::new_v4(),
            config,
            status: RunStatus::Running,
            started_at: Utc::now(),
            stopped_at: None,
            stats: self.stats.snapshot(),
        };
        if let Err(e) = self.ledger.store().put_run(&run) {
            warn!(run_id = %run.id, error = %e, "Failed to persist campaign run");
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let loops = if spawn_loops {
            scheduler.spawn_loops(shutdown_rx)
        } else {
            Vec::new()
        };
        *active = Some(ActiveRun {
            run: run.clone(),
            shutdown,
            _loops: loops,
        });

        self.sink
            .emit(AnalyticsEvent::new(EventType::CampaignStarted, None, None).with_detail(run.id.to_string()));
        metrics::gauge!("outreach.running").set(1.0);
        info!(
            run_id = %run.id,
            hydrated_leads = hydrated.leads,
            hydrated_instances = hydrated.instances,
            loops = spawn_loops,
            "Campaign started"
        );
        Ok(run)
    }

    /// Stops the run. Loops stop at once; calls already in flight finish but
    /// their results are discarded.
    pub fn stop(&self) -> CampaignResult<CampaignRun> {
        let Some(active) = self.active.lock().take() else {
            return Err(CampaignError::NotRunning);
        };
        self.run_state.end();
        let _ = active.shutdown.send(true);

        let mut run = active.run;
        run.status = RunStatus::Stopped;
        run.stopped_at = Some(Utc::now());
        run.stats = self.stats.snapshot();
        if let Err(e) = self.ledger.store().put_run(&run) {
            warn!(run_id = %run.id, error = %e, "Failed to persist campaign run");
        }

        self.sink
            .emit(AnalyticsEvent::new(EventType::CampaignStopped, None, None).with_detail(run.id.to_string()));
        metrics::gauge!("outreach.running").set(0.0);
        info!(run_id = %run.id, sent = run.stats.messages_sent, "Campaign stopped");
        Ok(run)
    }

    pub fn status(&self) -> StatusReport {
        let stats = self.stats.snapshot();
        let run = self.active.lock().as_ref().map(|active| {
            let mut run = active.run.clone();
            run.stats = stats.clone();
            run
        });
        StatusReport {
            running: self.run_state.is_running(),
            run,
            auto_reply_enabled: self.auto_reply_enabled(),
            leads: self.ledger.lead_count(),
            instances: InstanceCounts {
                active: self.ledger.count_by_status(SequenceStatus::Active),
                paused: self.ledger.count_by_status(SequenceStatus::Paused),
                stopped: self.ledger.count_by_status(SequenceStatus::Stopped),
                completed: self.ledger.count_by_status(SequenceStatus::Completed),
            },
            in_flight_keys: self.guard.active_keys(),
            stats,
        }
    }

    // ─── Operator actions ───────────────────────────────────────────────

    /// Adds an operator-supplied lead and starts its sequence right away.
    pub fn add_manual_lead(&self, info: ManualLead) -> CampaignResult<LeadReport> {
        if !is_usable_contact(&info.contact) {
            return Err(CampaignError::InvalidLead(format!(
                "contact '{}' is not usable",
                info.contact.trim()
            )));
        }
        let contact = normalize_contact(&info.contact);
        let mut lead = Lead::new(
            contact,
            LeadSource::Manual,
            info.priority.unwrap_or(Priority::Medium),
        );
        lead.name = info.name;
        lead.company = info.company;
        lead.attributes = info.attributes;

        let hint = info.interaction.unwrap_or(InteractionHint::ColdContact);
        let (lead, instance) = self.scheduler().enroll(lead, Some(hint), Utc::now())?;
        self.stats.incr(Counter::LeadsManual);
        self.sink
            .emit(AnalyticsEvent::new(EventType::LeadAdded, Some(lead.id), Some(instance.id)));
        info!(lead_id = %lead.id, template_id = %instance.template_id, "Manual lead added");
        Ok(LeadReport {
            last_failure: lead.last_failure_reason.clone(),
            lead,
            instance: Some(instance),
        })
    }

    pub fn set_auto_reply_enabled(&self, enabled: bool) {
        let previous = self.auto_reply.swap(enabled, Ordering::Relaxed);
        if previous != enabled {
            info!(enabled, "Auto reply toggled");
        }
    }

    pub fn auto_reply_enabled(&self) -> bool {
        self.auto_reply.load(Ordering::Relaxed)
    }

    /// Operator cancel: stops the lead's current sequence.
    pub fn cancel_sequence(&self, lead_id: Uuid) -> CampaignResult<SequenceInstance> {
        let instance = self.apply_to_current(
            lead_id,
            SequenceCommand::Stop(StopReason::OperatorCancel),
            Utc::now(),
        )?;
        self.stats.incr(Counter::SequencesStopped);
        self.sink.emit(
            AnalyticsEvent::new(EventType::SequenceStopped, Some(lead_id), Some(instance.id))
                .with_detail("operator_cancel"),
        );
        Ok(instance)
    }

    /// Resumes a paused sequence by switching it to `template_id`, or to the
    /// template the selection policy picks for the lead when none is given.
    pub fn resume_sequence(
        &self,
        lead_id: Uuid,
        template_id: Option<String>,
    ) -> CampaignResult<SequenceInstance> {
        let lead = self
            .ledger
            .get_lead(lead_id)
            .ok_or_else(|| CampaignError::not_found("lead", lead_id))?;
        if lead.status.is_suppressed() {
            return Err(CampaignError::InvalidLead(format!(
                "lead {lead_id} is {:?} and cannot be contacted",
                lead.status
            )));
        }
        let current = self
            .ledger
            .current_instance(lead_id)
            .ok_or_else(|| CampaignError::not_found("sequence", lead_id))?;
        if current.status != SequenceStatus::Paused {
            return Err(CampaignError::ConcurrencyViolation {
                instance_id: current.id,
                status: current.status.as_str().to_string(),
                action: "resume".to_string(),
            });
        }

        let now = Utc::now();
        let template_id = match template_id {
            Some(id) => self.catalog.resolve(&id)?.id.clone(),
            None => {
                let mut selection = SelectionContext::new(now);
                if let Some(at) = current.last_engagement_at {
                    selection = selection.with_last_engagement(at);
                }
                self.catalog.select_template(&lead, &selection).to_string()
            }
        };

        let instance = self.apply_to_current(
            lead_id,
            SequenceCommand::SwitchSequence {
                template_id: template_id.clone(),
            },
            now,
        )?;
        self.ledger.set_lead_status(lead_id, LeadStatus::Sequencing, now);
        self.stats.incr(Counter::SequencesSwitched);
        self.sink.emit(
            AnalyticsEvent::new(EventType::SequenceSwitched, Some(lead_id), Some(instance.id))
                .with_detail(template_id),
        );
        Ok(instance)
    }

    fn apply_to_current(
        &self,
        lead_id: Uuid,
        command: SequenceCommand,
        now: DateTime<Utc>,
    ) -> CampaignResult<SequenceInstance> {
        let current = self
            .ledger
            .current_instance(lead_id)
            .ok_or_else(|| CampaignError::not_found("sequence", lead_id))?;
        let scheduler = self.scheduler();
        let ctx = TransitionContext {
            catalog: &self.catalog,
            planner: scheduler.planner(),
            now,
            failure_budget: scheduler.config().max_consecutive_failures,
        };
        let action = command.name();
        let (outcome, snapshot) = self
            .ledger
            .update_instance(current.id, |instance| {
                let outcome = self.machine.apply(instance, command, &ctx);
                (outcome, instance.clone())
            })
            .ok_or_else(|| CampaignError::not_found("sequence", current.id))?;

        match outcome {
            Ok(TransitionOutcome::Stopped(reason)) => {
                info!(lead_id = %lead_id, instance_id = %snapshot.id, ?reason, "Sequence stopped by operator");
            }
            Ok(outcome) => {
                info!(lead_id = %lead_id, instance_id = %snapshot.id, ?outcome, action, "Operator action applied");
            }
            Err(e) => {
                warn!(lead_id = %lead_id, instance_id = %snapshot.id, action, error = %e, "Operator action rejected");
                return Err(e);
            }
        }
        Ok(snapshot)
    }

    pub fn lead_report(&self, lead_id: Uuid) -> CampaignResult<LeadReport> {
        let lead = self
            .ledger
            .get_lead(lead_id)
            .ok_or_else(|| CampaignError::not_found("lead", lead_id))?;
        let instance = self.ledger.current_instance(lead_id);
        let last_failure = lead
            .last_failure_reason
            .clone()
            .or_else(|| instance.as_ref().and_then(|i| i.last_failure.clone()));
        Ok(LeadReport {
            lead,
            instance,
            last_failure,
        })
    }

    pub fn sweep_retention(&self, now: DateTime<Utc>) -> usize {
        self.scheduler().sweep_retention(now)
    }

    // ─── Ticks ──────────────────────────────────────────────────────────

    pub async fn discovery_tick(&self, now: DateTime<Utc>) -> CampaignResult<DiscoveryReport> {
        self.scheduler().discovery_tick(now).await
    }

    /// Claims due instances and returns without waiting for their sends.
    pub fn start_dispatch(&self, now: DateTime<Utc>) -> CampaignResult<DispatchBatch> {
        self.scheduler().start_dispatch(now)
    }

    pub async fn dispatch_tick(&self, now: DateTime<Utc>) -> CampaignResult<DispatchReport> {
        self.scheduler().dispatch_tick(now).await
    }

    pub async fn poll_tick(&self, now: DateTime<Utc>) -> CampaignResult<PollReport> {
        self.scheduler().poll_tick(now).await
    }
}

impl Drop for CampaignController {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            self.run_state.end();
            let _ = active.shutdown.send(true);
        }
    }
}
