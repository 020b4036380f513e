//! Dry-run providers for running the engine without external services.
//!
//! Leads come from a JSON file, content is rendered from a fixed template,
//! mail is logged instead of sent, and no engagement is ever reported.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use campaign_core::config::LocalProvidersConfig;
use campaign_core::error::{CampaignResult, DeliveryError, ProviderError};
use campaign_core::types::{Lead, MessageContent, RawEvent, RawLead, Receipt};
use campaign_sequence::{Step, StepPurpose};
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::providers::{
    EngagementProvider, LeadDiscoveryProvider, MailDeliveryProvider, PersonalizationProvider,
    Providers,
};

/// Serves a fixed list of leads for every seed.
#[derive(Debug, Default, Clone)]
pub struct StaticLeadSource {
    leads: Vec<RawLead>,
}

impl StaticLeadSource {
    pub fn new(leads: Vec<RawLead>) -> Self {
        Self { leads }
    }

    /// Reads a JSON array of leads.
    pub fn from_file(path: impl AsRef<Path>) -> CampaignResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let leads: Vec<RawLead> = serde_json::from_str(&raw)?;
        info!(path = %path.as_ref().display(), count = leads.len(), "Loaded static leads");
        Ok(Self::new(leads))
    }
}

#[async_trait]
impl LeadDiscoveryProvider for StaticLeadSource {
    async fn discover(&self, seed: &str) -> Result<Vec<RawLead>, ProviderError> {
        // Leads tagged with a `seed` attribute only match that seed.
        Ok(self
            .leads
            .iter()
            .filter(|lead| {
                lead.attributes
                    .get("seed")
                    .map_or(true, |tag| tag.eq_ignore_ascii_case(seed))
            })
            .cloned()
            .collect())
    }

    fn provider_name(&self) -> &str {
        "static-leads"
    }
}

/// Renders a short plain-text message from the step purpose.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplatePersonalizer;

fn purpose_line(purpose: StepPurpose) -> (&'static str, &'static str) {
    match purpose {
        StepPurpose::Introduction => ("Quick introduction", "I wanted to introduce what we do"),
        StepPurpose::ValueProposition => ("An idea for {company}", "Here is where we usually help teams like yours"),
        StepPurpose::SocialProof => ("Teams like {company}", "A few teams similar to yours already work with us"),
        StepPurpose::CaseStudy => ("A short case study", "This write-up shows the results one customer saw"),
        StepPurpose::FollowUp => ("Following up", "Circling back on my earlier note"),
        StepPurpose::DemoInvite => ("15 minutes this week?", "Happy to walk you through a short demo"),
        StepPurpose::MeetingRecap => ("Recap of our call", "Thanks for your time, here is what we covered"),
        StepPurpose::ResourceShare => ("Something useful", "Sharing a resource you might find useful"),
        StepPurpose::CheckIn => ("Checking in", "Is this still a priority for you?"),
        StepPurpose::Reengagement => ("It has been a while", "A lot has changed since we last spoke"),
        StepPurpose::Breakup => ("Closing the loop", "I will stop reaching out after this one"),
        StepPurpose::ReplyAcknowledgement => ("Thanks for your reply", "Thanks for getting back to me, I will follow up personally"),
    }
}

fn fill(text: &str, context: &HashMap<String, String>) -> String {
    context.iter().fold(text.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}

#[async_trait]
impl PersonalizationProvider for TemplatePersonalizer {
    async fn generate_content(
        &self,
        lead: &Lead,
        step: &Step,
        context: &HashMap<String, String>,
    ) -> Result<MessageContent, ProviderError> {
        let mut context = context.clone();
        context
            .entry("company".to_string())
            .or_insert_with(|| lead.company.clone().unwrap_or_else(|| "your team".to_string()));
        let greeting = lead.name.as_deref().unwrap_or("there");
        let (subject, line) = purpose_line(step.purpose);
        Ok(MessageContent {
            subject: fill(subject, &context),
            body: format!("Hi {greeting},\n\n{}.\n", fill(line, &context)),
        })
    }

    fn provider_name(&self) -> &str {
        "template"
    }
}

/// Logs each message instead of delivering it.
#[derive(Debug, Default)]
pub struct LoggingMailer {
    sent: AtomicU64,
}

impl LoggingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MailDeliveryProvider for LoggingMailer {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Receipt, DeliveryError> {
        let message_id = Uuid::new_v4().to_string();
        self.sent.fetch_add(1, Ordering::Relaxed);
        info!(
            to,
            subject,
            body_len = body.len(),
            headers = headers.len(),
            message_id = %message_id,
            "Dry-run delivery"
        );
        Ok(Receipt {
            message_id,
            accepted_at: Utc::now(),
        })
    }

    fn provider_name(&self) -> &str {
        "logging-mailer"
    }
}

/// Never reports any engagement.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentEngagement;

#[async_trait]
impl EngagementProvider for SilentEngagement {
    async fn poll_events(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<RawEvent>, ProviderError> {
        Ok(Vec::new())
    }

    fn provider_name(&self) -> &str {
        "silent"
    }
}

/// Builds the dry-run provider bundle.
pub fn local_providers(config: &LocalProvidersConfig) -> CampaignResult<Providers> {
    let discovery = match &config.leads_file {
        Some(path) => StaticLeadSource::from_file(path)?,
        None => StaticLeadSource::default(),
    };
    Ok(Providers::new(
        Arc::new(discovery),
        Arc::new(TemplatePersonalizer),
        Arc::new(LoggingMailer::new()),
        Arc::new(SilentEngagement),
    ))
}
