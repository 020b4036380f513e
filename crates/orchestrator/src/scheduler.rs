//! Scheduler: the discovery, dispatch and interaction-poll loops.
//!
//! Each loop is a Tokio task on its own interval. Every tick is also a public
//! async method so callers (tests, the control surface) can drive it with an
//! explicit `now`. A tick's error is recorded in the loop's health and never
//! ends the loop; only the shutdown signal does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use campaign_core::config::CampaignConfig;
use campaign_core::error::{CampaignError, CampaignResult, DeliveryError, ProviderError};
use campaign_core::event_bus::EventSink;
use campaign_core::schedule::SendTimePlanner;
use campaign_core::types::{
    is_usable_contact, normalize_contact, AnalyticsEvent, EventType, InteractionEvent, InteractionHint,
    InteractionType, Lead, LeadSource, LeadStatus, Priority, RawEvent, RawLead, Receipt,
};
use campaign_intelligent_delivery::{SendPacer, SendWindow};
use campaign_sequence::{
    ActionDecision, IngestOutcome, SelectionContext, SequenceCatalog, SequenceCommand,
    SequenceInstance, SequenceStateMachine, SequenceStatus, Step, StepPurpose, StopReason,
    TransitionContext, TransitionOutcome, TriggerRouter,
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::guard::{ConcurrencyGuard, GuardKey, Guarded};
use crate::ledger::{DispatchClaim, DueEntry, Ledger};
use crate::providers::{correlation_headers, Providers};
use crate::stats::{Counter, LoopKind, StatsRecorder};

pub const DISCOVERY_DOMAIN: &str = "discovery";
pub const DISPATCH_DOMAIN: &str = "dispatch";
pub const ENGAGEMENT_DOMAIN: &str = "engagement";
pub const AUTO_REPLY_DOMAIN: &str = "auto_reply";

// ─── Run state ──────────────────────────────────────────────────────────

/// Whether a run is active, plus an epoch that changes on every start.
/// Work begun under one epoch is discarded if it finishes under another.
#[derive(Debug, Default)]
pub struct RunState {
    running: AtomicBool,
    epoch: AtomicU64,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.running.store(true, Ordering::SeqCst);
        epoch
    }

    pub fn end(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.is_running() && self.epoch() == epoch
    }
}

// ─── Tick reports ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    pub seeds: usize,
    pub discovered: usize,
    pub qualified: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub deduplicated_calls: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub selected: usize,
    pub sent: usize,
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
    pub bounced: usize,
    pub stale: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PollReport {
    pub received: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub unmatched: usize,
    pub unrecognized: usize,
    pub auto_replies: usize,
    pub reactivated: usize,
    pub archived: usize,
}

/// How one claimed instance's dispatch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent { completed: bool },
    Failed { stopped: bool },
    Bounced,
    /// Result discarded: the instance or the run changed while the call was
    /// outstanding.
    Stale,
    Skipped,
}

#[derive(Debug)]
enum AttemptError {
    Content(ProviderError),
    Delivery(DeliveryError),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Content(e) => write!(f, "content generation failed: {e}"),
            AttemptError::Delivery(e) => write!(f, "{e}"),
        }
    }
}

/// Dispatch tasks started by one tick. Dropping an unfinished batch detaches
/// its tasks; they still settle their instances.
pub struct DispatchBatch {
    report: DispatchReport,
    tasks: JoinSet<DispatchOutcome>,
}

impl DispatchBatch {
    /// Number of instances claimed and still being dispatched.
    pub fn launched(&self) -> usize {
        self.tasks.len()
    }

    /// Waits for every dispatch in the batch and tallies the outcomes.
    pub async fn finish(mut self) -> DispatchReport {
        let mut report = std::mem::take(&mut self.report);
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(DispatchOutcome::Sent { completed }) => {
                    report.sent += 1;
                    if completed {
                        report.completed += 1;
                    }
                }
                Ok(DispatchOutcome::Failed { stopped }) => {
                    report.failed += 1;
                    if stopped {
                        report.stopped += 1;
                    }
                }
                Ok(DispatchOutcome::Bounced) => report.bounced += 1,
                Ok(DispatchOutcome::Stale) => report.stale += 1,
                Ok(DispatchOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    error!(error = %e, "Dispatch task panicked");
                    report.skipped += 1;
                }
            }
        }

        if report.selected > 0 {
            info!(
                selected = report.selected,
                sent = report.sent,
                failed = report.failed,
                stale = report.stale,
                "Dispatch batch finished"
            );
        }
        report
    }
}

impl Drop for DispatchBatch {
    fn drop(&mut self) {
        self.tasks.detach_all();
    }
}

// ─── Scheduler ──────────────────────────────────────────────────────────

pub struct Scheduler {
    config: CampaignConfig,
    ledger: Arc<Ledger>,
    guard: Arc<ConcurrencyGuard>,
    catalog: Arc<SequenceCatalog>,
    machine: SequenceStateMachine,
    router: TriggerRouter,
    planner: Arc<dyn SendTimePlanner>,
    pacer: SendPacer,
    providers: Providers,
    stats: Arc<StatsRecorder>,
    sink: Arc<dyn EventSink>,
    run: Arc<RunState>,
    auto_reply: Arc<AtomicBool>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CampaignConfig,
        ledger: Arc<Ledger>,
        guard: Arc<ConcurrencyGuard>,
        catalog: Arc<SequenceCatalog>,
        providers: Providers,
        stats: Arc<StatsRecorder>,
        sink: Arc<dyn EventSink>,
        run: Arc<RunState>,
        auto_reply: Arc<AtomicBool>,
    ) -> CampaignResult<Self> {
        let window = SendWindow::from_config(&config)?;
        let router = TriggerRouter::new(&catalog, config.reactivation_cooldown_days)?;
        Ok(Self {
            pacer: SendPacer::from_config(&config),
            planner: Arc::new(window),
            machine: SequenceStateMachine::new(),
            router,
            config,
            ledger,
            guard,
            catalog,
            providers,
            stats,
            sink,
            run,
            auto_reply,
        })
    }

    pub fn config(&self) -> &CampaignConfig {
        &self.config
    }

    pub fn planner(&self) -> &dyn SendTimePlanner {
        self.planner.as_ref()
    }

    fn transition_ctx(&self, now: DateTime<Utc>) -> TransitionContext<'_> {
        TransitionContext {
            catalog: &self.catalog,
            planner: self.planner.as_ref(),
            now,
            failure_budget: self.config.max_consecutive_failures,
        }
    }

    fn ensure_running(&self) -> CampaignResult<u64> {
        if self.run.is_running() {
            Ok(self.run.epoch())
        } else {
            Err(CampaignError::NotRunning)
        }
    }

    fn emit(&self, event_type: EventType, lead_id: Uuid, sequence_id: Option<Uuid>, detail: Option<String>) {
        let mut event = AnalyticsEvent::new(event_type, Some(lead_id), sequence_id);
        event.detail = detail;
        self.sink.emit(event);
    }

    // ─── Loops ──────────────────────────────────────────────────────────

    /// Spawns the three loops. They run until `shutdown` flips to `true` or
    /// its sender is dropped.
    pub fn spawn_loops(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_loop(
                LoopKind::Discovery,
                StdDuration::from_secs(self.config.discovery_interval_secs),
                shutdown.clone(),
            ),
            self.spawn_loop(
                LoopKind::Dispatch,
                StdDuration::from_secs(self.config.dispatch_interval_secs),
                shutdown.clone(),
            ),
            self.spawn_loop(
                LoopKind::InteractionPoll,
                StdDuration::from_secs(self.config.poll_interval_secs),
                shutdown,
            ),
        ]
    }

    fn spawn_loop(
        self: &Arc<Self>,
        kind: LoopKind,
        period: StdDuration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(StdDuration::from_secs(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(loop_name = kind.as_str(), period_secs = period.as_secs(), "Scheduler loop started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Run the tick in its own task so a panic is recorded
                        // as a failed tick instead of ending the loop.
                        let mut tick = {
                            let scheduler = Arc::clone(&scheduler);
                            tokio::spawn(async move { scheduler.run_once(kind).await })
                        };
                        tokio::select! {
                            joined = &mut tick => {
                                if let Err(e) = joined {
                                    error!(loop_name = kind.as_str(), error = %e, "Scheduler tick panicked");
                                    scheduler.stats.tick_failed(kind, Utc::now(), &format!("tick panicked: {e}"));
                                }
                            }
                            _ = shutdown_requested(&mut shutdown) => {
                                // The tick keeps running; its results are stale.
                                info!(loop_name = kind.as_str(), "Shutdown requested during tick");
                                break;
                            }
                        }
                    }
                    _ = shutdown_requested(&mut shutdown) => break,
                }
            }

            info!(loop_name = kind.as_str(), "Scheduler loop stopped");
        })
    }

    /// One tick of `kind`, with its outcome recorded in the loop's health.
    pub async fn run_once(self: &Arc<Self>, kind: LoopKind) {
        let now = Utc::now();
        let result = match kind {
            LoopKind::Discovery => self
                .discovery_tick(now)
                .await
                .map(|report| report.errors.first().cloned()),
            LoopKind::Dispatch => self.start_dispatch(now).map(|batch| {
                // A slow send holds only its own instance; the loop moves on.
                if batch.launched() > 0 {
                    tokio::spawn(batch.finish());
                }
                None
            }),
            LoopKind::InteractionPoll => self.poll_tick(now).await.map(|_| None),
        };
        match result {
            Ok(None) => self.stats.tick_ok(kind, now),
            Ok(Some(partial)) => {
                warn!(loop_name = kind.as_str(), error = %partial, "Scheduler tick completed with errors");
                self.stats.tick_failed(kind, now, &partial);
            }
            Err(CampaignError::NotRunning) => {
                debug!(loop_name = kind.as_str(), "Tick skipped, campaign not running");
            }
            Err(e) => {
                error!(loop_name = kind.as_str(), error = %e, "Scheduler tick failed");
                self.stats.tick_failed(kind, now, &e.to_string());
            }
        }
    }

    // ─── Enrollment ─────────────────────────────────────────────────────

    /// Records `lead`, picks its template and starts its first instance.
    pub fn enroll(
        &self,
        mut lead: Lead,
        hint: Option<InteractionHint>,
        now: DateTime<Utc>,
    ) -> CampaignResult<(Lead, SequenceInstance)> {
        lead.status = LeadStatus::Ready;
        lead.created_at = now;
        lead.updated_at = now;
        let lead = self.ledger.insert_lead(lead)?;

        let mut selection = SelectionContext::new(now);
        if let Some(hint) = hint {
            selection = selection.with_interaction(hint);
        }
        let template = self
            .catalog
            .resolve(self.catalog.select_template(&lead, &selection))?;

        let due = self.planner.plan(now + template.offset(0).unwrap_or_else(Duration::zero));
        let instance = SequenceInstance::start(lead.id, template, personalization_context(&lead), now, due);
        self.ledger.insert_instance(instance.clone())?;
        self.ledger.set_lead_status(lead.id, LeadStatus::Sequencing, now);

        self.stats.incr(Counter::SequencesStarted);
        metrics::counter!("outreach.sequences_started").increment(1);
        self.emit(
            EventType::SequenceStarted,
            lead.id,
            Some(instance.id),
            Some(instance.template_id.clone()),
        );
        info!(
            lead_id = %lead.id,
            instance_id = %instance.id,
            template_id = %instance.template_id,
            next_due_at = %due,
            "Sequence started"
        );

        let lead = self.ledger.get_lead(lead.id).unwrap_or(lead);
        Ok((lead, instance))
    }

    // ─── Discovery ──────────────────────────────────────────────────────

    pub async fn discovery_tick(&self, now: DateTime<Utc>) -> CampaignResult<DiscoveryReport> {
        let epoch = self.ensure_running()?;
        let mut report = DiscoveryReport {
            seeds: self.config.discovery_seeds.len(),
            ..DiscoveryReport::default()
        };

        for seed in &self.config.discovery_seeds {
            let key = GuardKey::new(DISCOVERY_DOMAIN, seed);
            let discovery = Arc::clone(&self.providers.discovery);
            let query = key.argument().to_string();
            let outcome = self
                .guard
                .execute_guarded(key, || async move { discovery.discover(&query).await })
                .await;

            let raw_leads = match outcome {
                Ok(Guarded::Executed(leads)) => leads,
                Ok(Guarded::Deduplicated(_)) => {
                    report.deduplicated_calls += 1;
                    self.stats.incr(Counter::DuplicateCallsSuppressed);
                    continue;
                }
                Err(e) => {
                    let e = e.into_campaign_error(self.providers.discovery.provider_name());
                    warn!(seed = %seed, error = %e, "Discovery call failed, retrying next tick");
                    report.errors.push(e.to_string());
                    continue;
                }
            };

            if !self.run.is_current(epoch) {
                self.stats.incr(Counter::StaleResultsDiscarded);
                info!(seed = %seed, results = raw_leads.len(), "Campaign stopped during discovery, discarding results");
                return Ok(report);
            }

            for raw in raw_leads {
                report.discovered += 1;
                self.stats.incr(Counter::LeadsDiscovered);
                match self.qualify(raw, seed) {
                    Some(lead) => match self.enroll(lead, Some(InteractionHint::ColdContact), now) {
                        Ok((lead, _)) => {
                            report.qualified += 1;
                            self.stats.incr(Counter::LeadsQualified);
                            metrics::counter!("outreach.leads_qualified").increment(1);
                            self.emit(EventType::LeadDiscovered, lead.id, None, Some(seed.clone()));
                        }
                        Err(CampaignError::Duplicate { .. }) => report.duplicates += 1,
                        Err(e) => {
                            warn!(seed = %seed, error = %e, "Failed to enroll discovered lead");
                            report.errors.push(e.to_string());
                        }
                    },
                    None => report.rejected += 1,
                }
            }
        }

        info!(
            seeds = report.seeds,
            discovered = report.discovered,
            qualified = report.qualified,
            duplicates = report.duplicates,
            "Discovery tick finished"
        );
        Ok(report)
    }

    /// Turns a raw discovery record into a lead, or rejects it.
    fn qualify(&self, raw: RawLead, seed: &str) -> Option<Lead> {
        if !is_usable_contact(&raw.contact) {
            debug!(contact = %raw.contact, "Discovered lead rejected: unusable contact");
            return None;
        }
        let contact = normalize_contact(&raw.contact);
        if self.ledger.contains_contact(&contact) {
            return None;
        }
        let score = raw.score.unwrap_or(self.config.min_lead_score);
        if score < self.config.min_lead_score {
            debug!(contact = %contact, score, "Discovered lead rejected: score below minimum");
            return None;
        }
        let priority = raw.score.map_or(Priority::Medium, Priority::from_score);
        let mut lead = Lead::new(contact, LeadSource::Discovery(seed.to_string()), priority);
        lead.name = raw.name;
        lead.company = raw.company;
        lead.attributes = raw.attributes;
        Some(lead)
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    /// Due instances in dispatch order: priority first, then due time,
    /// bounded by the batch size.
    pub fn select_due(&self, now: DateTime<Utc>) -> Vec<DueEntry> {
        let mut due = self.ledger.due_entries(now);
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.next_due_at.cmp(&b.next_due_at))
                .then(a.instance_id.cmp(&b.instance_id))
        });
        due.truncate(self.config.batch_size);
        due
    }

    /// Claims every due instance and starts one dispatch task per claim,
    /// without waiting for any of them. A claimed instance carries the busy
    /// flag, so later ticks skip it until its task settles.
    pub fn start_dispatch(self: &Arc<Self>, now: DateTime<Utc>) -> CampaignResult<DispatchBatch> {
        let epoch = self.ensure_running()?;
        let due = self.select_due(now);
        let offsets = self.pacer.start_offsets(due.len(), &mut rand::thread_rng());

        let mut batch = DispatchBatch {
            report: DispatchReport {
                selected: due.len(),
                ..DispatchReport::default()
            },
            tasks: JoinSet::new(),
        };
        for (entry, offset) in due.into_iter().zip(offsets) {
            // Claim in selection order, before any task starts.
            let Some(claim) = self.ledger.claim_for_dispatch(entry.instance_id, now) else {
                batch.report.skipped += 1;
                continue;
            };
            let scheduler = Arc::clone(self);
            let at = now + Duration::from_std(offset).unwrap_or_else(|_| Duration::zero());
            batch.tasks.spawn(async move {
                if !offset.is_zero() {
                    tokio::time::sleep(offset).await;
                }
                scheduler.dispatch_one(claim, at, epoch).await
            });
        }
        Ok(batch)
    }

    /// Starts a dispatch batch and waits for all of it.
    pub async fn dispatch_tick(self: &Arc<Self>, now: DateTime<Utc>) -> CampaignResult<DispatchReport> {
        Ok(self.start_dispatch(now)?.finish().await)
    }

    /// Sends the claimed step and settles the instance. The busy flag is
    /// cleared on every path.
    async fn dispatch_one(&self, claim: DispatchClaim, at: DateTime<Utc>, epoch: u64) -> DispatchOutcome {
        let id = claim.instance_id;

        let Some(instance) = self.ledger.get_instance(id) else {
            return DispatchOutcome::Skipped;
        };
        if !self.run.is_current(epoch) || !claim.still_matches(&instance) {
            self.ledger.release(id);
            self.discard_stale(&claim, "state changed before send");
            return DispatchOutcome::Stale;
        }
        let Some(lead) = self.ledger.get_lead(claim.lead_id) else {
            self.ledger.release(id);
            return DispatchOutcome::Skipped;
        };
        if lead.status.is_suppressed() {
            self.ledger.release(id);
            return DispatchOutcome::Skipped;
        }
        let Some(step) = self
            .catalog
            .resolve(&claim.template_id)
            .ok()
            .and_then(|t| t.step(claim.step_index).cloned())
        else {
            warn!(instance_id = %id, step_index = claim.step_index, "Claimed step does not exist");
            self.ledger.release(id);
            return DispatchOutcome::Skipped;
        };

        let headers = correlation_headers(lead.id, id, claim.step_index, &self.config.sender_address);
        let (personalization, mail) = (&self.providers.personalization, &self.providers.mail);
        let (lead_ref, step_ref, context, headers_ref) = (&lead, &step, &instance.context, &headers);
        let attempt = self
            .guard
            .execute_guarded(GuardKey::new(DISPATCH_DOMAIN, id.to_string()), || async move {
                let content = personalization
                    .generate_content(lead_ref, step_ref, context)
                    .await
                    .map_err(AttemptError::Content)?;
                let receipt = mail
                    .send(&lead_ref.contact, &content.subject, &content.body, headers_ref)
                    .await
                    .map_err(AttemptError::Delivery)?;
                Ok::<_, AttemptError>(Some(receipt))
            })
            .await;

        match attempt {
            Ok(Guarded::Deduplicated(_)) => {
                self.ledger.release(id);
                self.stats.incr(Counter::DuplicateCallsSuppressed);
                DispatchOutcome::Skipped
            }
            Ok(Guarded::Executed(receipt)) => self.settle_success(&claim, receipt, at, epoch),
            Err(AttemptError::Delivery(DeliveryError::HardBounce(reason))) => {
                self.settle_bounce(&claim, &reason, at, epoch)
            }
            Err(e) => self.settle_failure(&claim, e.to_string(), at, epoch),
        }
    }

    /// Clears the busy flag and, if the claim is still valid, applies
    /// `command`. `None` means the result was stale.
    fn settle(
        &self,
        claim: &DispatchClaim,
        command: SequenceCommand,
        at: DateTime<Utc>,
        epoch: u64,
    ) -> Option<CampaignResult<TransitionOutcome>> {
        let run_current = self.run.is_current(epoch);
        let ctx = self.transition_ctx(at);
        self.ledger
            .update_instance(claim.instance_id, |instance| {
                instance.in_flight = false;
                if !run_current || !claim.still_matches(instance) {
                    return None;
                }
                Some(self.machine.apply(instance, command, &ctx))
            })
            .flatten()
    }

    fn discard_stale(&self, claim: &DispatchClaim, why: &str) {
        self.stats.incr(Counter::StaleResultsDiscarded);
        metrics::counter!("outreach.stale_discarded").increment(1);
        info!(
            instance_id = %claim.instance_id,
            lead_id = %claim.lead_id,
            step_index = claim.step_index,
            reason = why,
            "Discarding stale dispatch result"
        );
    }

    fn settle_success(
        &self,
        claim: &DispatchClaim,
        receipt: Option<Receipt>,
        at: DateTime<Utc>,
        epoch: u64,
    ) -> DispatchOutcome {
        let command = SequenceCommand::DispatchSucceeded {
            step_index: claim.step_index,
        };
        let outcome = match self.settle(claim, command, at, epoch) {
            None => {
                self.discard_stale(claim, "state changed while sending");
                return DispatchOutcome::Stale;
            }
            Some(Err(e)) => {
                warn!(instance_id = %claim.instance_id, error = %e, "Dispatch result rejected");
                return DispatchOutcome::Stale;
            }
            Some(Ok(outcome)) => outcome,
        };

        self.stats.incr(Counter::MessagesSent);
        metrics::counter!("outreach.sent").increment(1);
        let message_id = receipt.map(|r| r.message_id);
        let event = InteractionEvent {
            id: format!("sent:{}:{}:{}", claim.instance_id, claim.generation, claim.step_index),
            lead_id: claim.lead_id,
            sequence_id: claim.instance_id,
            kind: InteractionType::Sent,
            step_index: Some(claim.step_index),
            timestamp: at,
        };
        self.ledger.record_event(&event);
        self.ledger.update_lead(claim.lead_id, |lead| {
            lead.last_failure_reason = None;
            lead.updated_at = at;
        });
        self.emit(EventType::StepSent, claim.lead_id, Some(claim.instance_id), message_id.clone());
        info!(
            instance_id = %claim.instance_id,
            lead_id = %claim.lead_id,
            step_index = claim.step_index,
            message_id = message_id.as_deref().unwrap_or(""),
            "Step sent"
        );

        let completed = matches!(outcome, TransitionOutcome::Completed);
        if completed {
            self.stats.incr(Counter::SequencesCompleted);
            self.emit(EventType::SequenceCompleted, claim.lead_id, Some(claim.instance_id), None);
        }
        DispatchOutcome::Sent { completed }
    }

    fn settle_failure(&self, claim: &DispatchClaim, reason: String, at: DateTime<Utc>, epoch: u64) -> DispatchOutcome {
        let command = SequenceCommand::DispatchFailed {
            reason: reason.clone(),
        };
        let outcome = match self.settle(claim, command, at, epoch) {
            None => {
                self.discard_stale(claim, "state changed while sending");
                return DispatchOutcome::Stale;
            }
            Some(Err(e)) => {
                warn!(instance_id = %claim.instance_id, error = %e, "Dispatch failure not recorded");
                return DispatchOutcome::Stale;
            }
            Some(Ok(outcome)) => outcome,
        };

        self.stats.incr(Counter::DeliveryFailures);
        metrics::counter!("outreach.delivery_failures").increment(1);
        self.ledger.update_lead(claim.lead_id, |lead| {
            lead.last_failure_reason = Some(reason.clone());
            lead.updated_at = at;
        });
        self.emit(EventType::DeliveryFailed, claim.lead_id, Some(claim.instance_id), Some(reason.clone()));

        let stopped = matches!(outcome, TransitionOutcome::Stopped(StopReason::SendFailed));
        if stopped {
            self.stats.incr(Counter::SequencesStopped);
            self.emit(
                EventType::SequenceStopped,
                claim.lead_id,
                Some(claim.instance_id),
                Some("send_failed".into()),
            );
            warn!(instance_id = %claim.instance_id, lead_id = %claim.lead_id, error = %reason, "Failure budget exhausted, sequence stopped");
        } else {
            warn!(instance_id = %claim.instance_id, lead_id = %claim.lead_id, error = %reason, "Dispatch failed, will retry next tick");
        }
        DispatchOutcome::Failed { stopped }
    }

    fn settle_bounce(&self, claim: &DispatchClaim, reason: &str, at: DateTime<Utc>, epoch: u64) -> DispatchOutcome {
        let command = SequenceCommand::Stop(StopReason::Bounced);
        match self.settle(claim, command, at, epoch) {
            None => {
                self.discard_stale(claim, "state changed while sending");
                return DispatchOutcome::Stale;
            }
            Some(Err(e)) => {
                warn!(instance_id = %claim.instance_id, error = %e, "Bounce not applied");
                return DispatchOutcome::Stale;
            }
            Some(Ok(_)) => {}
        }

        self.stats.incr(Counter::Bounces);
        self.stats.incr(Counter::SequencesStopped);
        metrics::counter!("outreach.bounces").increment(1);
        self.ledger.set_lead_status(claim.lead_id, LeadStatus::Bounced, at);
        self.ledger.update_lead(claim.lead_id, |lead| {
            lead.last_failure_reason = Some(format!("hard bounce: {reason}"));
        });
        self.emit(
            EventType::SequenceStopped,
            claim.lead_id,
            Some(claim.instance_id),
            Some("bounced".into()),
        );
        warn!(instance_id = %claim.instance_id, lead_id = %claim.lead_id, reason, "Hard bounce, sequence stopped");
        DispatchOutcome::Bounced
    }

    // ─── Interaction poll ───────────────────────────────────────────────

    pub async fn poll_tick(&self, now: DateTime<Utc>) -> CampaignResult<PollReport> {
        let epoch = self.ensure_running()?;
        let since = self.ledger.poll_cursor();
        let engagement = Arc::clone(&self.providers.engagement);

        let outcome = self
            .guard
            .execute_guarded(GuardKey::new(ENGAGEMENT_DOMAIN, "poll"), || async move {
                engagement.poll_events(since).await
            })
            .await
            .map_err(|e| e.into_campaign_error(self.providers.engagement.provider_name()))?;

        let mut report = PollReport::default();
        let raw_events = match outcome {
            Guarded::Executed(events) => events,
            Guarded::Deduplicated(_) => {
                self.stats.incr(Counter::DuplicateCallsSuppressed);
                return Ok(report);
            }
        };
        if !self.run.is_current(epoch) {
            self.stats.incr(Counter::StaleResultsDiscarded);
            info!(events = raw_events.len(), "Campaign stopped during poll, discarding events");
            return Ok(report);
        }

        report.received = raw_events.len();
        let mut replied = Vec::new();
        for raw in &raw_events {
            if let Some(lead_id) = self.route_event(raw, now, &mut report) {
                replied.push(lead_id);
            }
        }
        if let Some(newest) = raw_events.iter().map(|raw| raw.occurred_at).max() {
            self.ledger.advance_poll_cursor(newest);
        }

        if self.auto_reply.load(Ordering::Relaxed) {
            for lead_id in replied {
                // Each acknowledgement is an outbound send; none go out once
                // the run has ended.
                if !self.run.is_current(epoch) {
                    self.stats.incr(Counter::StaleResultsDiscarded);
                    info!(lead_id = %lead_id, "Campaign stopped, skipping auto reply");
                    break;
                }
                if self.send_auto_reply(lead_id, now).await {
                    report.auto_replies += 1;
                }
            }
        }

        report.reactivated = self.sweep_dormant(now);
        report.archived = self.sweep_retention(now);

        if report.received > 0 {
            info!(
                received = report.received,
                applied = report.applied,
                duplicates = report.duplicates,
                unmatched = report.unmatched,
                "Interaction poll finished"
            );
        }
        Ok(report)
    }

    /// Feeds one raw record through the trigger router. Returns the lead id
    /// when the record was a newly applied reply.
    fn route_event(&self, raw: &RawEvent, now: DateTime<Utc>, report: &mut PollReport) -> Option<Uuid> {
        let Some(kind) = InteractionType::parse(&raw.kind) else {
            report.unrecognized += 1;
            debug!(kind = %raw.kind, "Unrecognized interaction kind");
            return None;
        };
        let Some(lead) = self.ledger.lead_by_contact(&normalize_contact(&raw.contact)) else {
            report.unmatched += 1;
            return None;
        };
        let Some(instance_id) = self.ledger.resolve_instance_for(lead.id, raw.sequence_id) else {
            report.unmatched += 1;
            return None;
        };

        let event = InteractionEvent {
            id: raw.id.clone().unwrap_or_else(|| derive_event_id(raw)),
            lead_id: lead.id,
            sequence_id: instance_id,
            kind,
            step_index: raw.step_index,
            timestamp: raw.occurred_at,
        };
        if !self.ledger.mark_event_seen(&event.id, instance_id) {
            report.duplicates += 1;
            debug!(event_id = %event.id, "Engagement record already routed");
            return None;
        }

        let ctx = self.transition_ctx(now);
        let Some(outcome) = self.ledger.update_instance(instance_id, |instance| {
            self.router.ingest(instance, &event, &self.machine, &ctx)
        }) else {
            self.ledger.forget_event(&event.id);
            report.unmatched += 1;
            return None;
        };

        let (decision, transition) = match outcome {
            IngestOutcome::Duplicate => {
                report.duplicates += 1;
                return None;
            }
            IngestOutcome::Applied { decision, transition } => {
                report.applied += 1;
                (decision, transition)
            }
            IngestOutcome::Rejected { decision, .. } => {
                report.rejected += 1;
                (decision, None)
            }
        };

        self.ledger.record_event(&event);
        self.record_interaction(&event, &decision, transition.as_ref(), now);
        (kind == InteractionType::Replied).then_some(lead.id)
    }

    fn record_interaction(
        &self,
        event: &InteractionEvent,
        decision: &ActionDecision,
        transition: Option<&TransitionOutcome>,
        now: DateTime<Utc>,
    ) {
        metrics::counter!("outreach.events", "kind" => format!("{:?}", event.kind).to_lowercase()).increment(1);
        match event.kind {
            InteractionType::Sent => {}
            InteractionType::Opened => self.stats.incr(Counter::Opens),
            InteractionType::Clicked => self.stats.incr(Counter::Clicks),
            InteractionType::Replied => {
                self.stats.incr(Counter::Replies);
                self.ledger.set_lead_status(event.lead_id, LeadStatus::Replied, now);
            }
            InteractionType::Unsubscribed => {
                self.stats.incr(Counter::Unsubscribes);
                self.ledger.set_lead_status(event.lead_id, LeadStatus::Unsubscribed, now);
            }
            InteractionType::Bounced => {
                self.stats.incr(Counter::Bounces);
                self.ledger.set_lead_status(event.lead_id, LeadStatus::Bounced, now);
            }
        }
        self.emit(
            EventType::InteractionRecorded,
            event.lead_id,
            Some(event.sequence_id),
            Some(event.id.clone()),
        );

        match transition {
            Some(TransitionOutcome::Paused(_)) => {
                self.stats.incr(Counter::SequencesPaused);
                self.emit(EventType::SequencePaused, event.lead_id, Some(event.sequence_id), None);
            }
            Some(TransitionOutcome::Stopped(reason)) => {
                self.stats.incr(Counter::SequencesStopped);
                self.emit(
                    EventType::SequenceStopped,
                    event.lead_id,
                    Some(event.sequence_id),
                    Some(format!("{reason:?}").to_lowercase()),
                );
            }
            Some(TransitionOutcome::Switched { to, .. }) => {
                self.stats.incr(Counter::SequencesSwitched);
                self.emit(EventType::SequenceSwitched, event.lead_id, Some(event.sequence_id), Some(to.clone()));
            }
            _ => {}
        }
        debug!(event_id = %event.id, kind = ?event.kind, decision = ?decision, "Interaction routed");
    }

    /// Sends one acknowledgement for a reply. Never changes instance state.
    async fn send_auto_reply(&self, lead_id: Uuid, now: DateTime<Utc>) -> bool {
        let Some(lead) = self.ledger.get_lead(lead_id) else {
            return false;
        };
        if lead.status.is_suppressed() {
            debug!(lead_id = %lead_id, "Auto reply skipped for suppressed lead");
            return false;
        }
        let context = self
            .ledger
            .current_instance(lead_id)
            .map(|i| i.context)
            .unwrap_or_else(|| personalization_context(&lead));
        let step = Step::new(0, StepPurpose::ReplyAcknowledgement, Priority::High);
        let mut headers = HashMap::new();
        headers.insert("From".to_string(), self.config.sender_address.clone());
        headers.insert("X-Outreach-Lead".to_string(), lead_id.to_string());
        headers.insert("X-Outreach-Auto-Reply".to_string(), "true".to_string());

        let (personalization, mail) = (&self.providers.personalization, &self.providers.mail);
        let (lead_ref, step_ref, context_ref, headers_ref) = (&lead, &step, &context, &headers);
        let result = self
            .guard
            .execute_guarded(GuardKey::new(AUTO_REPLY_DOMAIN, lead_id.to_string()), || async move {
                let content = personalization
                    .generate_content(lead_ref, step_ref, context_ref)
                    .await
                    .map_err(AttemptError::Content)?;
                mail.send(&lead_ref.contact, &content.subject, &content.body, headers_ref)
                    .await
                    .map_err(AttemptError::Delivery)?;
                Ok::<_, AttemptError>(true)
            })
            .await;

        match result {
            Ok(Guarded::Executed(_)) => {
                self.stats.incr(Counter::AutoRepliesSent);
                metrics::counter!("outreach.auto_replies").increment(1);
                self.emit(EventType::AutoReplySent, lead_id, None, None);
                info!(lead_id = %lead_id, at = %now, "Auto reply sent");
                true
            }
            Ok(Guarded::Deduplicated(_)) => {
                self.stats.incr(Counter::DuplicateCallsSuppressed);
                false
            }
            Err(e) => {
                warn!(lead_id = %lead_id, error = %e, "Auto reply failed");
                metrics::counter!("outreach.auto_reply_failures").increment(1);
                false
            }
        }
    }

    // ─── Sweeps ─────────────────────────────────────────────────────────

    /// Starts a reactivation successor for every completed instance that has
    /// gone quiet past the cooldown.
    pub fn sweep_dormant(&self, now: DateTime<Utc>) -> usize {
        let mut reactivated = 0;
        for completed in self.ledger.instances_with_status(SequenceStatus::Completed) {
            let ActionDecision::SwitchSequence { template_id } = self.router.evaluate_dormant(&completed, now) else {
                continue;
            };
            let Some(lead) = self.ledger.get_lead(completed.lead_id) else {
                continue;
            };
            if lead.status.is_suppressed() || lead.status == LeadStatus::Replied {
                continue;
            }
            if self.ledger.current_instance(lead.id).map(|i| i.id) != Some(completed.id) {
                continue;
            }
            let Ok(template) = self.catalog.resolve(&template_id) else {
                continue;
            };

            let due = self.planner.plan(now);
            let successor = SequenceInstance::start(lead.id, template, completed.context.clone(), now, due);
            let successor_id = successor.id;
            if let Err(e) = self.ledger.insert_instance(successor) {
                warn!(lead_id = %lead.id, error = %e, "Reactivation skipped");
                continue;
            }
            self.ledger
                .update_instance(completed.id, |i| i.successor_id = Some(successor_id));
            self.ledger.set_lead_status(lead.id, LeadStatus::Sequencing, now);

            reactivated += 1;
            self.stats.incr(Counter::SequencesReactivated);
            self.stats.incr(Counter::SequencesStarted);
            self.emit(
                EventType::SequenceReactivated,
                lead.id,
                Some(successor_id),
                Some(completed.id.to_string()),
            );
            info!(lead_id = %lead.id, predecessor = %completed.id, successor = %successor_id, "Dormant sequence reactivated");
        }
        reactivated
    }

    /// Archives terminal instances that ended more than `retention_days` ago.
    pub fn sweep_retention(&self, now: DateTime<Utc>) -> usize {
        let Some(cutoff) = Duration::try_days(self.config.retention_days)
            .and_then(|retention| now.checked_sub_signed(retention))
        else {
            warn!(retention_days = self.config.retention_days, "Retention period out of range, skipping sweep");
            return 0;
        };
        let expired: Vec<Uuid> = [
            SequenceStatus::Completed,
            SequenceStatus::Stopped,
        ]
        .into_iter()
        .flat_map(|status| self.ledger.instances_with_status(status))
        .filter(|i| i.ended_at.is_some_and(|ended| ended < cutoff))
        .map(|i| i.id)
        .collect();

        let archived = expired
            .into_iter()
            .filter(|id| self.ledger.archive(*id).is_some())
            .count();
        if archived > 0 {
            info!(archived, "Retention sweep archived instances");
        }
        archived
    }
}

/// Personalization context seeded from the lead's profile.
/// Resolves once shutdown is signalled or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

pub fn personalization_context(lead: &Lead) -> HashMap<String, String> {
    let mut context = lead.attributes.clone();
    context.insert("contact".to_string(), lead.contact.clone());
    if let Some(name) = &lead.name {
        context.insert("name".to_string(), name.clone());
    }
    if let Some(company) = &lead.company {
        context.insert("company".to_string(), company.clone());
    }
    context
}

/// Stable id for a record the provider did not identify.
pub fn derive_event_id(raw: &RawEvent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_contact(&raw.contact).as_bytes());
    hasher.update(b"|");
    hasher.update(raw.kind.trim().to_ascii_lowercase().as_bytes());
    hasher.update(b"|");
    if let Some(sequence_id) = raw.sequence_id {
        hasher.update(sequence_id.as_bytes());
    }
    hasher.update(b"|");
    if let Some(step) = raw.step_index {
        hasher.update(step.to_le_bytes());
    }
    hasher.update(b"|");
    hasher.update(raw.occurred_at.to_rfc3339().as_bytes());
    format!("derived:{}", hex::encode(&hasher.finalize()[..16]))
}
