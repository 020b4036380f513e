//! External collaborator contracts.
//!
//! Discovery, content generation, mail transport and engagement polling live
//! outside the engine. Each is an object-safe async trait held as
//! `Arc<dyn …>` so implementations can be swapped without touching the
//! scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use campaign_core::error::{DeliveryError, ProviderError};
use campaign_core::types::{Lead, MessageContent, RawEvent, RawLead, Receipt};
use campaign_sequence::Step;
use chrono::{DateTime, Utc};

/// Finds candidate contacts for a seed query.
#[async_trait]
pub trait LeadDiscoveryProvider: Send + Sync {
    async fn discover(&self, seed: &str) -> Result<Vec<RawLead>, ProviderError>;

    fn provider_name(&self) -> &str {
        "discovery"
    }
}

/// Produces the subject and body for one step of a lead's sequence.
#[async_trait]
pub trait PersonalizationProvider: Send + Sync {
    async fn generate_content(
        &self,
        lead: &Lead,
        step: &Step,
        context: &HashMap<String, String>,
    ) -> Result<MessageContent, ProviderError>;

    fn provider_name(&self) -> &str {
        "personalization"
    }
}

/// Hands a rendered message to the transport.
#[async_trait]
pub trait MailDeliveryProvider: Send + Sync {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Receipt, DeliveryError>;

    fn provider_name(&self) -> &str {
        "mail"
    }
}

/// Reports recipient behavior observed since a point in time.
#[async_trait]
pub trait EngagementProvider: Send + Sync {
    async fn poll_events(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RawEvent>, ProviderError>;

    fn provider_name(&self) -> &str {
        "engagement"
    }
}

/// The full set of collaborators the scheduler talks to.
#[derive(Clone)]
pub struct Providers {
    pub discovery: Arc<dyn LeadDiscoveryProvider>,
    pub personalization: Arc<dyn PersonalizationProvider>,
    pub mail: Arc<dyn MailDeliveryProvider>,
    pub engagement: Arc<dyn EngagementProvider>,
}

impl Providers {
    pub fn new(
        discovery: Arc<dyn LeadDiscoveryProvider>,
        personalization: Arc<dyn PersonalizationProvider>,
        mail: Arc<dyn MailDeliveryProvider>,
        engagement: Arc<dyn EngagementProvider>,
    ) -> Self {
        Self {
            discovery,
            personalization,
            mail,
            engagement,
        }
    }
}

impl std::fmt::Debug for Providers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Providers")
            .field("discovery", &self.discovery.provider_name())
            .field("personalization", &self.personalization.provider_name())
            .field("mail", &self.mail.provider_name())
            .field("engagement", &self.engagement.provider_name())
            .finish()
    }
}

/// Headers attached to every outbound message so replies and engagement can
/// be correlated back to the sequence.
pub fn correlation_headers(
    lead_id: uuid::Uuid,
    sequence_id: uuid::Uuid,
    step_index: usize,
    sender: &str,
) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert("From".to_string(), sender.to_string());
    headers.insert("X-Outreach-Lead".to_string(), lead_id.to_string());
    headers.insert("X-Outreach-Sequence".to_string(), sequence_id.to_string());
    headers.insert("X-Outreach-Step".to_string(), step_index.to_string());
    headers
}
