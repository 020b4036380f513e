//! In-memory arena of leads and sequence instances.
//!
//! The ledger is the single owner of engine state. Every mutation goes
//! through a closure run under a `DashMap` entry lock, and the resulting
//! snapshot is mirrored into the [`PersistenceStore`] before that lock is
//! released, so the store sees writes to one record in the order they
//! happened. No entry guard is ever held across an `.await`.

use std::sync::Arc;

use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::types::{InteractionEvent, Lead, LeadStatus, Priority};
use campaign_sequence::{SequenceInstance, SequenceStatus};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::PersistenceStore;

/// Snapshot taken when an instance is claimed for dispatch. On resumption the
/// live instance must still match it or the result is stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchClaim {
    pub instance_id: Uuid,
    pub lead_id: Uuid,
    pub template_id: String,
    pub step_index: usize,
    pub generation: u32,
}

impl DispatchClaim {
    pub fn still_matches(&self, instance: &SequenceInstance) -> bool {
        instance.status == SequenceStatus::Active
            && instance.template_id == self.template_id
            && instance.generation == self.generation
            && instance.current_step_index == self.step_index
    }
}

/// An instance eligible for dispatch, with the fields used to order it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueEntry {
    pub instance_id: Uuid,
    pub priority: Priority,
    pub next_due_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HydrationReport {
    pub leads: usize,
    pub instances: usize,
}

pub struct Ledger {
    leads: DashMap<Uuid, Lead>,
    contacts: DashMap<String, Uuid>,
    instances: DashMap<Uuid, SequenceInstance>,
    /// Latest instance per lead. At most one non-terminal instance exists per
    /// lead, and when one exists it is this one.
    current_by_lead: DashMap<Uuid, Uuid>,
    /// Every engagement record id already routed, with the instance it was
    /// routed to. Spans instances, so a redelivered record cannot reach a
    /// successor sequence.
    seen_events: DashMap<String, Uuid>,
    poll_cursor: Mutex<Option<DateTime<Utc>>>,
    store: Arc<dyn PersistenceStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        Self {
            leads: DashMap::new(),
            contacts: DashMap::new(),
            instances: DashMap::new(),
            current_by_lead: DashMap::new(),
            seen_events: DashMap::new(),
            poll_cursor: Mutex::new(None),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn PersistenceStore> {
        &self.store
    }

    // ─── Leads ──────────────────────────────────────────────────────────

    /// Inserts a lead whose contact is not yet known.
    pub fn insert_lead(&self, lead: Lead) -> CampaignResult<Lead> {
        match self.contacts.entry(lead.contact.clone()) {
            Entry::Occupied(_) => {
                return Err(CampaignError::Duplicate {
                    kind: "lead",
                    id: lead.contact,
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(lead.id);
            }
        }
        // Mirror first: once the lead is visible, updates may mirror newer copies.
        self.mirror_lead(&lead);
        self.leads.insert(lead.id, lead.clone());
        debug!(lead_id = %lead.id, contact = %lead.contact, "Lead recorded");
        Ok(lead)
    }

    pub fn contains_contact(&self, contact: &str) -> bool {
        self.contacts.contains_key(contact)
    }

    pub fn lead_by_contact(&self, contact: &str) -> Option<Lead> {
        let id = *self.contacts.get(contact)?;
        self.get_lead(id)
    }

    pub fn get_lead(&self, id: Uuid) -> Option<Lead> {
        self.leads.get(&id).map(|r| r.value().clone())
    }

    pub fn update_lead<R>(&self, id: Uuid, f: impl FnOnce(&mut Lead) -> R) -> Option<R> {
        let mut entry = self.leads.get_mut(&id)?;
        let result = f(entry.value_mut());
        self.mirror_lead(entry.value());
        Some(result)
    }

    pub fn set_lead_status(&self, id: Uuid, status: LeadStatus, now: DateTime<Utc>) {
        self.update_lead(id, |lead| {
            // Suppression is sticky.
            if lead.status.is_suppressed() && !status.is_suppressed() {
                return;
            }
            lead.status = status;
            lead.updated_at = now;
        });
    }

    pub fn lead_count(&self) -> usize {
        self.leads.len()
    }

    pub fn leads(&self) -> Vec<Lead> {
        self.leads.iter().map(|r| r.value().clone()).collect()
    }

    // ─── Instances ──────────────────────────────────────────────────────

    /// Registers a new instance as the lead's current one. Fails when the lead
    /// already has a non-terminal instance.
    pub fn insert_instance(&self, instance: SequenceInstance) -> CampaignResult<()> {
        match self.current_by_lead.entry(instance.lead_id) {
            Entry::Occupied(mut current) => {
                let live = self
                    .instances
                    .get(current.get())
                    .is_some_and(|existing| !existing.status.is_terminal());
                if live {
                    return Err(CampaignError::Duplicate {
                        kind: "active sequence",
                        id: instance.lead_id.to_string(),
                    });
                }
                current.insert(instance.id);
            }
            Entry::Vacant(slot) => {
                slot.insert(instance.id);
            }
        }
        self.mirror_instance(&instance);
        self.instances.insert(instance.id, instance);
        Ok(())
    }

    pub fn get_instance(&self, id: Uuid) -> Option<SequenceInstance> {
        self.instances.get(&id).map(|r| r.value().clone())
    }

    pub fn current_instance(&self, lead_id: Uuid) -> Option<SequenceInstance> {
        let id = *self.current_by_lead.get(&lead_id)?;
        self.get_instance(id)
    }

    /// Instance an event refers to: the named sequence when it is known and
    /// belongs to the lead, otherwise the lead's current instance.
    pub fn resolve_instance_for(&self, lead_id: Uuid, sequence_id: Option<Uuid>) -> Option<Uuid> {
        if let Some(id) = sequence_id {
            if self.instances.get(&id).is_some_and(|i| i.lead_id == lead_id) {
                return Some(id);
            }
        }
        self.current_by_lead.get(&lead_id).map(|r| *r.value())
    }

    /// Runs `f` on the instance and mirrors the result, both under its
    /// entry lock.
    pub fn update_instance<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut SequenceInstance) -> R,
    ) -> Option<R> {
        let mut entry = self.instances.get_mut(&id)?;
        let result = f(entry.value_mut());
        self.mirror_instance(entry.value());
        Some(result)
    }

    /// Sets the busy flag if the instance is still due. Returns the claim
    /// snapshot on success.
    pub fn claim_for_dispatch(&self, id: Uuid, now: DateTime<Utc>) -> Option<DispatchClaim> {
        let mut entry = self.instances.get_mut(&id)?;
        let instance = entry.value_mut();
        if !instance.is_due(now) {
            return None;
        }
        instance.in_flight = true;
        Some(DispatchClaim {
            instance_id: instance.id,
            lead_id: instance.lead_id,
            template_id: instance.template_id.clone(),
            step_index: instance.current_step_index,
            generation: instance.generation,
        })
    }

    pub fn release(&self, id: Uuid) {
        if let Some(mut entry) = self.instances.get_mut(&id) {
            entry.in_flight = false;
        }
    }

    /// Active, unclaimed instances whose due time has passed, with the lead
    /// priority used for ordering. Leads that are suppressed are skipped.
    pub fn due_entries(&self, now: DateTime<Utc>) -> Vec<DueEntry> {
        self.instances
            .iter()
            .filter(|r| r.is_due(now))
            .filter_map(|r| {
                let lead = self.leads.get(&r.lead_id)?;
                if lead.status.is_suppressed() {
                    return None;
                }
                Some(DueEntry {
                    instance_id: r.id,
                    priority: lead.priority,
                    next_due_at: r.next_due_at?,
                })
            })
            .collect()
    }

    pub fn instances_with_status(&self, status: SequenceStatus) -> Vec<SequenceInstance> {
        self.instances
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.value().clone())
            .collect()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn count_by_status(&self, status: SequenceStatus) -> usize {
        self.instances.iter().filter(|r| r.status == status).count()
    }

    /// Drops a terminal instance from the arena and archives it in the store.
    pub fn archive(&self, id: Uuid) -> Option<SequenceInstance> {
        let (_, instance) = self
            .instances
            .remove_if(&id, |_, instance| instance.status.is_terminal())?;
        self.current_by_lead
            .remove_if(&instance.lead_id, |_, current| *current == id);
        if let Err(e) = self.store.archive_instance(&instance) {
            warn!(instance_id = %id, error = %e, "Failed to archive instance");
        }
        Some(instance)
    }

    // ─── Events ─────────────────────────────────────────────────────────

    pub fn record_event(&self, event: &InteractionEvent) {
        if let Err(e) = self.store.put_event(event) {
            warn!(event_id = %event.id, error = %e, "Failed to persist interaction event");
        }
    }

    /// Marks an engagement record as routed to `instance_id`. Returns false
    /// when the id was already routed, to this or any other instance, either
    /// in this process or in a stored event.
    pub fn mark_event_seen(&self, id: &str, instance_id: Uuid) -> bool {
        match self.seen_events.entry(id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => match self.store.get_event(id) {
                Ok(Some(stored)) => {
                    slot.insert(stored.sequence_id);
                    false
                }
                _ => {
                    slot.insert(instance_id);
                    true
                }
            },
        }
    }

    /// Undoes [`mark_event_seen`](Self::mark_event_seen) for a record that
    /// could not be routed after all.
    pub fn forget_event(&self, id: &str) {
        self.seen_events.remove(id);
    }

    // ─── Poll cursor ────────────────────────────────────────────────────

    pub fn poll_cursor(&self) -> Option<DateTime<Utc>> {
        *self.poll_cursor.lock()
    }

    /// Moves the cursor forward and persists it. Never moves it back.
    pub fn advance_poll_cursor(&self, at: DateTime<Utc>) {
        let mut cursor = self.poll_cursor.lock();
        if cursor.is_some_and(|current| current >= at) {
            return;
        }
        *cursor = Some(at);
        if let Err(e) = self.store.put_poll_cursor(at) {
            warn!(cursor = %at, error = %e, "Failed to persist poll cursor");
        }
    }

    // ─── Hydration ──────────────────────────────────────────────────────

    /// Loads leads, non-terminal instances and the poll cursor from the
    /// store. Records already present in memory win over stored copies.
    pub fn hydrate(&self) -> CampaignResult<HydrationReport> {
        let mut report = HydrationReport::default();

        if let Some(stored) = self.store.get_poll_cursor()? {
            let mut cursor = self.poll_cursor.lock();
            if cursor.map_or(true, |current| current < stored) {
                *cursor = Some(stored);
            }
        }

        for lead in self.store.list_leads(None)? {
            if let Entry::Vacant(slot) = self.contacts.entry(lead.contact.clone()) {
                slot.insert(lead.id);
                self.leads.insert(lead.id, lead);
                report.leads += 1;
            }
        }

        for mut instance in self.store.list_instances(None)? {
            if instance.status.is_terminal() || self.instances.contains_key(&instance.id) {
                continue;
            }
            if !self.leads.contains_key(&instance.lead_id) {
                warn!(instance_id = %instance.id, lead_id = %instance.lead_id, "Stored instance has no lead, skipping");
                continue;
            }
            instance.in_flight = false;
            match self.current_by_lead.entry(instance.lead_id) {
                Entry::Occupied(_) => {
                    warn!(instance_id = %instance.id, lead_id = %instance.lead_id, "Lead already has a live instance, skipping");
                    continue;
                }
                Entry::Vacant(slot) => {
                    slot.insert(instance.id);
                }
            }
            self.instances.insert(instance.id, instance);
            report.instances += 1;
        }

        info!(leads = report.leads, instances = report.instances, "Ledger hydrated");
        Ok(report)
    }

    // ─── Mirroring ──────────────────────────────────────────────────────

    fn mirror_lead(&self, lead: &Lead) {
        if let Err(e) = self.store.put_lead(lead) {
            warn!(lead_id = %lead.id, error = %e, "Failed to persist lead");
        }
    }

    fn mirror_instance(&self, instance: &SequenceInstance) {
        if let Err(e) = self.store.put_instance(instance) {
            warn!(instance_id = %instance.id, error = %e, "Failed to persist instance");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use campaign_core::types::LeadSource;
    use campaign_sequence::SequenceCatalog;
    use chrono::Duration;
    use std::collections::HashMap;

    fn ledger() -> (Ledger, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (Ledger::new(store.clone()), store)
    }

    fn start(lead: &Lead, due: DateTime<Utc>) -> SequenceInstance {
        let catalog = SequenceCatalog::with_defaults();
        let template = catalog.resolve("cold_outreach").unwrap();
        SequenceInstance::start(lead.id, template, HashMap::new(), due, due)
    }

    #[test]
    fn test_duplicate_contact_rejected() {
        let (ledger, _) = ledger();
        let lead = Lead::new("a@x.io".into(), LeadSource::Manual, Priority::High);
        ledger.insert_lead(lead).unwrap();
        let dup = Lead::new("a@x.io".into(), LeadSource::Manual, Priority::Low);
        assert!(matches!(
            ledger.insert_lead(dup),
            Err(CampaignError::Duplicate { kind: "lead", .. })
        ));
        assert_eq!(ledger.lead_count(), 1);
        assert!(ledger.contains_contact("a@x.io"));
    }

    #[test]
    fn test_one_live_instance_per_lead() {
        let (ledger, _) = ledger();
        let lead = ledger
            .insert_lead(Lead::new("a@x.io".into(), LeadSource::Manual, Priority::High))
            .unwrap();
        let now = Utc::now();
        let first = start(&lead, now);
        let first_id = first.id;
        ledger.insert_instance(first).unwrap();
        assert!(ledger.insert_instance(start(&lead, now)).is_err());

        ledger.update_instance(first_id, |i| i.status = SequenceStatus::Completed);
        let second = start(&lead, now);
        let second_id = second.id;
        ledger.insert_instance(second).unwrap();
        assert_eq!(ledger.current_instance(lead.id).unwrap().id, second_id);
    }

    #[test]
    fn test_claim_is_exclusive_until_released() {
        let (ledger, _) = ledger();
        let lead = ledger
            .insert_lead(Lead::new("a@x.io".into(), LeadSource::Manual, Priority::High))
            .unwrap();
        let now = Utc::now();
        let instance = start(&lead, now - Duration::minutes(1));
        let id = instance.id;
        ledger.insert_instance(instance).unwrap();

        assert_eq!(ledger.due_entries(now).len(), 1);
        let claim = ledger.claim_for_dispatch(id, now).unwrap();
        assert_eq!(claim.step_index, 0);
        assert!(ledger.claim_for_dispatch(id, now).is_none());
        assert!(ledger.due_entries(now).is_empty());

        ledger.release(id);
        assert!(ledger.claim_for_dispatch(id, now).is_some());
    }

    #[test]
    fn test_claim_detects_stale_state() {
        let (ledger, _) = ledger();
        let lead = ledger
            .insert_lead(Lead::new("a@x.io".into(), LeadSource::Manual, Priority::High))
            .unwrap();
        let now = Utc::now();
        let instance = start(&lead, now);
        let id = instance.id;
        ledger.insert_instance(instance).unwrap();
        let claim = ledger.claim_for_dispatch(id, now).unwrap();

        ledger.update_instance(id, |i| i.status = SequenceStatus::Paused);
        assert!(!claim.still_matches(&ledger.get_instance(id).unwrap()));
    }

    #[test]
    fn test_suppressed_leads_are_not_due() {
        let (ledger, _) = ledger();
        let lead = ledger
            .insert_lead(Lead::new("a@x.io".into(), LeadSource::Manual, Priority::High))
            .unwrap();
        let now = Utc::now();
        ledger.insert_instance(start(&lead, now)).unwrap();
        ledger.set_lead_status(lead.id, LeadStatus::Unsubscribed, now);
        assert!(ledger.due_entries(now).is_empty());

        // Suppression does not get overwritten by a later non-suppressed status.
        ledger.set_lead_status(lead.id, LeadStatus::Sequencing, now);
        assert_eq!(ledger.get_lead(lead.id).unwrap().status, LeadStatus::Unsubscribed);
    }

    #[test]
    fn test_archive_only_terminal() {
        let (ledger, store) = ledger();
        let lead = ledger
            .insert_lead(Lead::new("a@x.io".into(), LeadSource::Manual, Priority::High))
            .unwrap();
        let now = Utc::now();
        let instance = start(&lead, now);
        let id = instance.id;
        ledger.insert_instance(instance).unwrap();

        assert!(ledger.archive(id).is_none());
        ledger.update_instance(id, |i| i.status = SequenceStatus::Stopped);
        assert!(ledger.archive(id).is_some());
        assert!(ledger.get_instance(id).is_none());
        assert!(ledger.current_instance(lead.id).is_none());
        assert_eq!(store.archived_count(), 1);
        assert!(ledger.get_lead(lead.id).is_some());
    }

    #[test]
    fn test_hydrate_restores_live_state() {
        let store = Arc::new(InMemoryStore::new());
        let first = Ledger::new(store.clone());
        let lead = first
            .insert_lead(Lead::new("a@x.io".into(), LeadSource::Manual, Priority::High))
            .unwrap();
        let now = Utc::now();
        let instance = start(&lead, now);
        let id = instance.id;
        first.insert_instance(instance).unwrap();
        first.claim_for_dispatch(id, now).unwrap();
        // Busy flag only lives in memory; persist a copy that claims it anyway.
        let mut stored = first.get_instance(id).unwrap();
        stored.in_flight = true;
        store.put_instance(&stored).unwrap();

        let second = Ledger::new(store);
        let report = second.hydrate().unwrap();
        assert_eq!(report, HydrationReport { leads: 1, instances: 1 });
        assert!(second.contains_contact("a@x.io"));
        assert!(!second.get_instance(id).unwrap().in_flight);
        assert_eq!(second.current_instance(lead.id).unwrap().id, id);

        // Idempotent.
        assert_eq!(second.hydrate().unwrap(), HydrationReport::default());
    }

    #[test]
    fn test_store_copy_keeps_the_last_update() {
        let (ledger, store) = ledger();
        let lead = ledger
            .insert_lead(Lead::new("a@x.io".into(), LeadSource::Manual, Priority::High))
            .unwrap();
        let instance = start(&lead, Utc::now());
        let id = instance.id;
        ledger.insert_instance(instance).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..200 {
                        ledger.update_instance(id, |i| i.counters.sent += 1);
                        ledger.update_lead(lead.id, |l| l.updated_at = Utc::now());
                    }
                });
            }
        });

        let live = ledger.get_instance(id).unwrap();
        assert_eq!(live.counters.sent, 1600);
        assert_eq!(store.get_instance(id).unwrap().unwrap().counters.sent, 1600);
        assert_eq!(
            store.get_lead(lead.id).unwrap().unwrap().updated_at,
            ledger.get_lead(lead.id).unwrap().updated_at
        );
    }

    #[test]
    fn test_event_ids_are_seen_across_instances() {
        let (ledger, store) = ledger();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(ledger.mark_event_seen("click-1", first));
        assert!(!ledger.mark_event_seen("click-1", second));

        // An id that could not be routed can be routed later.
        assert!(ledger.mark_event_seen("open-1", first));
        ledger.forget_event("open-1");
        assert!(ledger.mark_event_seen("open-1", second));

        // Stored events count as seen after a restart.
        let lead_id = Uuid::new_v4();
        store
            .put_event(&InteractionEvent {
                id: "reply-1".into(),
                lead_id,
                sequence_id: first,
                kind: campaign_core::types::InteractionType::Replied,
                step_index: Some(0),
                timestamp: Utc::now(),
            })
            .unwrap();
        let restarted = Ledger::new(store);
        assert!(!restarted.mark_event_seen("reply-1", second));
    }

    #[test]
    fn test_poll_cursor_only_moves_forward_and_survives_restart() {
        let (ledger, store) = ledger();
        let noon = Utc::now();
        assert_eq!(ledger.poll_cursor(), None);

        ledger.advance_poll_cursor(noon);
        ledger.advance_poll_cursor(noon - Duration::hours(1));
        assert_eq!(ledger.poll_cursor(), Some(noon));
        assert_eq!(store.get_poll_cursor().unwrap(), Some(noon));

        let restarted = Ledger::new(store);
        restarted.hydrate().unwrap();
        assert_eq!(restarted.poll_cursor(), Some(noon));
    }
}
