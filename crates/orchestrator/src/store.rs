//! Durable mirror of engine state.
//!
//! The controller owns leads and instances; the store only receives copies.
//! Writes are fire-and-forget from the engine's point of view: a failed
//! write is logged and never rolls back an in-memory transition.

use campaign_core::error::CampaignResult;
use campaign_core::types::{CampaignRun, InteractionEvent, InteractionType, Lead, LeadStatus, RunStatus};
use campaign_sequence::{SequenceInstance, SequenceStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

pub trait PersistenceStore: Send + Sync {
    fn put_lead(&self, lead: &Lead) -> CampaignResult<()>;
    fn get_lead(&self, id: Uuid) -> CampaignResult<Option<Lead>>;
    fn list_leads(&self, status: Option<LeadStatus>) -> CampaignResult<Vec<Lead>>;

    fn put_instance(&self, instance: &SequenceInstance) -> CampaignResult<()>;
    fn get_instance(&self, id: Uuid) -> CampaignResult<Option<SequenceInstance>>;
    fn list_instances(&self, status: Option<SequenceStatus>) -> CampaignResult<Vec<SequenceInstance>>;
    /// Moves a terminal instance out of the live set.
    fn archive_instance(&self, instance: &SequenceInstance) -> CampaignResult<()>;

    fn put_event(&self, event: &InteractionEvent) -> CampaignResult<()>;
    fn get_event(&self, id: &str) -> CampaignResult<Option<InteractionEvent>>;
    fn list_events(&self, kind: Option<InteractionType>) -> CampaignResult<Vec<InteractionEvent>>;

    /// Newest engagement timestamp already polled.
    fn put_poll_cursor(&self, at: DateTime<Utc>) -> CampaignResult<()>;
    fn get_poll_cursor(&self) -> CampaignResult<Option<DateTime<Utc>>>;

    fn put_run(&self, run: &CampaignRun) -> CampaignResult<()>;
    fn get_run(&self, id: Uuid) -> CampaignResult<Option<CampaignRun>>;
    fn list_runs(&self, status: Option<RunStatus>) -> CampaignResult<Vec<CampaignRun>>;
}

/// Process-local store. Survives controller restarts within one process.
#[derive(Default)]
pub struct InMemoryStore {
    leads: DashMap<Uuid, Lead>,
    instances: DashMap<Uuid, SequenceInstance>,
    archived: DashMap<Uuid, SequenceInstance>,
    events: DashMap<String, InteractionEvent>,
    runs: DashMap<Uuid, CampaignRun>,
    poll_cursor: Mutex<Option<DateTime<Utc>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn archived_count(&self) -> usize {
        self.archived.len()
    }

    pub fn get_archived(&self, id: Uuid) -> Option<SequenceInstance> {
        self.archived.get(&id).map(|r| r.value().clone())
    }
}

impl PersistenceStore for InMemoryStore {
    fn put_lead(&self, lead: &Lead) -> CampaignResult<()> {
        self.leads.insert(lead.id, lead.clone());
        Ok(())
    }

    fn get_lead(&self, id: Uuid) -> CampaignResult<Option<Lead>> {
        Ok(self.leads.get(&id).map(|r| r.value().clone()))
    }

    fn list_leads(&self, status: Option<LeadStatus>) -> CampaignResult<Vec<Lead>> {
        let mut leads: Vec<Lead> = self
            .leads
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .map(|r| r.value().clone())
            .collect();
        leads.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(leads)
    }

    fn put_instance(&self, instance: &SequenceInstance) -> CampaignResult<()> {
        self.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    fn get_instance(&self, id: Uuid) -> CampaignResult<Option<SequenceInstance>> {
        Ok(self.instances.get(&id).map(|r| r.value().clone()))
    }

    fn list_instances(&self, status: Option<SequenceStatus>) -> CampaignResult<Vec<SequenceInstance>> {
        let mut instances: Vec<SequenceInstance> = self
            .instances
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .map(|r| r.value().clone())
            .collect();
        instances.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(instances)
    }

    fn archive_instance(&self, instance: &SequenceInstance) -> CampaignResult<()> {
        self.instances.remove(&instance.id);
        self.archived.insert(instance.id, instance.clone());
        Ok(())
    }

    fn put_event(&self, event: &InteractionEvent) -> CampaignResult<()> {
        self.events.insert(event.id.clone(), event.clone());
        Ok(())
    }

    fn get_event(&self, id: &str) -> CampaignResult<Option<InteractionEvent>> {
        Ok(self.events.get(id).map(|r| r.value().clone()))
    }

    fn list_events(&self, kind: Option<InteractionType>) -> CampaignResult<Vec<InteractionEvent>> {
        let mut events: Vec<InteractionEvent> = self
            .events
            .iter()
            .filter(|r| kind.map_or(true, |k| r.kind == k))
            .map(|r| r.value().clone())
            .collect();
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(events)
    }

    fn put_poll_cursor(&self, at: DateTime<Utc>) -> CampaignResult<()> {
        *self.poll_cursor.lock() = Some(at);
        Ok(())
    }

    fn get_poll_cursor(&self) -> CampaignResult<Option<DateTime<Utc>>> {
        Ok(*self.poll_cursor.lock())
    }

    fn put_run(&self, run: &CampaignRun) -> CampaignResult<()> {
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    fn get_run(&self, id: Uuid) -> CampaignResult<Option<CampaignRun>> {
        Ok(self.runs.get(&id).map(|r| r.value().clone()))
    }

    fn list_runs(&self, status: Option<RunStatus>) -> CampaignResult<Vec<CampaignRun>> {
        let mut runs: Vec<CampaignRun> = self
            .runs
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .map(|r| r.value().clone())
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_core::types::{LeadSource, Priority};
    use campaign_sequence::SequenceCatalog;
    use chrono::Utc;
    use std::collections::HashMap;

    #[test]
    fn test_leads_by_status() {
        let store = InMemoryStore::new();
        let mut a = Lead::new("a@x.io".into(), LeadSource::Manual, Priority::High);
        a.status = LeadStatus::Sequencing;
        let b = Lead::new("b@x.io".into(), LeadSource::Manual, Priority::Low);
        store.put_lead(&a).unwrap();
        store.put_lead(&b).unwrap();

        assert_eq!(store.list_leads(None).unwrap().len(), 2);
        let sequencing = store.list_leads(Some(LeadStatus::Sequencing)).unwrap();
        assert_eq!(sequencing.len(), 1);
        assert_eq!(sequencing[0].contact, "a@x.io");
        assert_eq!(store.get_lead(b.id).unwrap().unwrap().contact, "b@x.io");
        assert!(store.get_lead(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_archive_moves_instance_out_of_live_set() {
        let store = InMemoryStore::new();
        let catalog = SequenceCatalog::with_defaults();
        let template = catalog.resolve("nurture").unwrap();
        let now = Utc::now();
        let mut instance = SequenceInstance::start(Uuid::new_v4(), template, HashMap::new(), now, now);
        store.put_instance(&instance).unwrap();
        assert_eq!(store.list_instances(Some(SequenceStatus::Active)).unwrap().len(), 1);

        instance.status = SequenceStatus::Completed;
        store.archive_instance(&instance).unwrap();
        assert!(store.get_instance(instance.id).unwrap().is_none());
        assert_eq!(store.archived_count(), 1);
        assert_eq!(
            store.get_archived(instance.id).unwrap().status,
            SequenceStatus::Completed
        );
    }
}
