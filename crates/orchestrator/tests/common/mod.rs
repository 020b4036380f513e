//! Scriptable providers and fixtures shared by the orchestrator integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use campaign_core::config::CampaignConfig;
use campaign_core::error::{DeliveryError, ProviderError};
use campaign_core::event_bus::MemorySink;
use campaign_core::types::{Lead, MessageContent, RawEvent, RawLead, Receipt};
use campaign_orchestrator::{
    CampaignController, EngagementProvider, InMemoryStore, LeadDiscoveryProvider,
    MailDeliveryProvider, PersistenceStore, PersonalizationProvider, Providers,
};
use campaign_sequence::{SequenceCatalog, SequenceInstance, SequenceStatus, Step, StepPurpose};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

/// Monday 2026-03-02 08:00 UTC, an hour before the first send window.
pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
}

pub fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

/// No jitter and no pacing, so due times are exact.
pub fn config() -> CampaignConfig {
    CampaignConfig {
        max_jitter_minutes: 0,
        spacing_min_secs: 0,
        spacing_max_secs: 0,
        discovery_seeds: vec!["rust cto".to_string()],
        sender_address: "sdr@acme.test".to_string(),
        ..CampaignConfig::default()
    }
}

pub fn raw_lead(contact: &str, score: f32) -> RawLead {
    RawLead {
        contact: contact.to_string(),
        name: Some("Ada".to_string()),
        company: Some("Analytical Engines".to_string()),
        score: Some(score),
        attributes: HashMap::new(),
    }
}

pub fn raw_event(id: Option<&str>, contact: &str, kind: &str, occurred_at: DateTime<Utc>) -> RawEvent {
    RawEvent {
        id: id.map(str::to_string),
        contact: contact.to_string(),
        sequence_id: None,
        kind: kind.to_string(),
        step_index: None,
        occurred_at,
    }
}

// ─── Discovery ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeDiscovery {
    results: Mutex<HashMap<String, Vec<RawLead>>>,
    pub calls: AtomicUsize,
    /// When set, each call waits for a permit before returning.
    gate: Mutex<Option<Arc<Semaphore>>>,
    pub entered: Notify,
}

impl FakeDiscovery {
    pub fn with(seed: &str, leads: Vec<RawLead>) -> Self {
        let discovery = Self::default();
        discovery.results.lock().insert(seed.to_string(), leads);
        discovery
    }

    pub fn gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeadDiscoveryProvider for FakeDiscovery {
    async fn discover(&self, seed: &str) -> Result<Vec<RawLead>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        }
        Ok(self.results.lock().get(seed).cloned().unwrap_or_default())
    }
}

// ─── Personalization ────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakePersonalizer {
    pub purposes: Mutex<Vec<StepPurpose>>,
    pub fail: Mutex<bool>,
}

#[async_trait]
impl PersonalizationProvider for FakePersonalizer {
    async fn generate_content(
        &self,
        lead: &Lead,
        step: &Step,
        _context: &HashMap<String, String>,
    ) -> Result<MessageContent, ProviderError> {
        if *self.fail.lock() {
            return Err(ProviderError::Unavailable("model offline".into()));
        }
        self.purposes.lock().push(step.purpose);
        Ok(MessageContent {
            subject: format!("{:?} for {}", step.purpose, lead.contact),
            body: "hello".to_string(),
        })
    }
}

// ─── Mail ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MailMode {
    #[default]
    Accept,
    Transient,
    HardBounce,
}

#[derive(Debug, Clone)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub headers: HashMap<String, String>,
}

#[derive(Default)]
pub struct FakeMailer {
    pub sent: Mutex<Vec<SentMail>>,
    pub mode: Mutex<MailMode>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    /// Sends to this contact never return.
    hang_for: Mutex<Option<String>>,
    pub entered: Notify,
}

impl FakeMailer {
    pub fn hang_for(&self, contact: &str) {
        *self.hang_for.lock() = Some(contact.to_string());
    }

    pub fn set_mode(&self, mode: MailMode) {
        *self.mode.lock() = mode;
    }

    pub fn gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl MailDeliveryProvider for FakeMailer {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        _body: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Receipt, DeliveryError> {
        self.entered.notify_one();
        let hangs = self.hang_for.lock().as_deref() == Some(to);
        if hangs {
            std::future::pending::<()>().await;
        }
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| DeliveryError::Transient(e.to_string()))?;
        }
        let mode = *self.mode.lock();
        match mode {
            MailMode::Accept => {
                self.sent.lock().push(SentMail {
                    to: to.to_string(),
                    subject: subject.to_string(),
                    headers: headers.clone(),
                });
                Ok(Receipt {
                    message_id: Uuid::new_v4().to_string(),
                    accepted_at: Utc::now(),
                })
            }
            MailMode::Transient => Err(DeliveryError::Transient("smtp timeout".into())),
            MailMode::HardBounce => Err(DeliveryError::HardBounce("mailbox does not exist".into())),
        }
    }
}

// ─── Engagement ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeEngagement {
    pending: Mutex<Vec<RawEvent>>,
    pub polls: AtomicUsize,
    /// The `since` argument of every poll, in call order.
    pub sinces: Mutex<Vec<Option<DateTime<Utc>>>>,
}

impl FakeEngagement {
    pub fn push(&self, event: RawEvent) {
        self.pending.lock().push(event);
    }

    pub fn last_since(&self) -> Option<DateTime<Utc>> {
        self.sinces.lock().last().copied().flatten()
    }
}

#[async_trait]
impl EngagementProvider for FakeEngagement {
    async fn poll_events(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RawEvent>, ProviderError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.sinces.lock().push(since);
        Ok(std::mem::take(&mut *self.pending.lock()))
    }
}

// ─── Harness ────────────────────────────────────────────────────────────

pub struct Harness {
    pub controller: Arc<CampaignController>,
    pub discovery: Arc<FakeDiscovery>,
    pub personalizer: Arc<FakePersonalizer>,
    pub mailer: Arc<FakeMailer>,
    pub engagement: Arc<FakeEngagement>,
    pub store: Arc<InMemoryStore>,
    pub events: Arc<MemorySink>,
}

impl Harness {
    pub fn new(config: CampaignConfig, discovery: FakeDiscovery) -> Self {
        let discovery = Arc::new(discovery);
        let personalizer = Arc::new(FakePersonalizer::default());
        let mailer = Arc::new(FakeMailer::default());
        let engagement = Arc::new(FakeEngagement::default());
        let store = Arc::new(InMemoryStore::new());
        let events = Arc::new(MemorySink::new(256));
        let providers = Providers::new(
            discovery.clone(),
            personalizer.clone(),
            mailer.clone(),
            engagement.clone(),
        );
        let controller = CampaignController::with_parts(
            config.clone(),
            providers,
            store.clone() as Arc<dyn PersistenceStore>,
            SequenceCatalog::with_defaults(),
            events.clone(),
        )
        .unwrap();
        controller.start_without_loops(config).unwrap();
        Self {
            controller: Arc::new(controller),
            discovery,
            personalizer,
            mailer,
            engagement,
            store,
            events,
        }
    }

    /// One high-score lead discovered at [`start`].
    pub async fn with_one_lead(config: CampaignConfig) -> (Self, Uuid) {
        let harness = Self::new(
            config,
            FakeDiscovery::with("rust cto", vec![raw_lead("ada@example.com", 0.9)]),
        );
        let report = harness.controller.discovery_tick(start()).await.unwrap();
        assert_eq!(report.qualified, 1);
        let lead = harness
            .controller
            .ledger()
            .lead_by_contact("ada@example.com")
            .unwrap();
        (harness, lead.id)
    }

    pub fn instance(&self, lead_id: Uuid) -> SequenceInstance {
        self.controller.ledger().current_instance(lead_id).unwrap()
    }

    /// Dispatches at each due time until the lead's sequence leaves `Active`.
    /// Returns the time of the last dispatch.
    pub async fn drive_to_end(&self, lead_id: Uuid) -> DateTime<Utc> {
        let mut last = start();
        for _ in 0..32 {
            let instance = self.instance(lead_id);
            if instance.status != SequenceStatus::Active {
                return last;
            }
            let due = instance.next_due_at.unwrap();
            self.controller.dispatch_tick(due).await.unwrap();
            last = due;
        }
        panic!("sequence never left active");
    }
}
