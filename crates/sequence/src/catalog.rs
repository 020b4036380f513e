use std::collections::HashMap;

use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::types::{InteractionHint, Lead, Priority};
use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::types::{SequenceTemplate, Step, StepPurpose};

pub const COLD_OUTREACH: &str = "cold_outreach";
pub const DEMO_INTEREST: &str = "demo_interest";
pub const POST_MEETING: &str = "post_meeting";
pub const HIGH_INTENT: &str = "high_intent";
pub const REACTIVATION: &str = "reactivation";
pub const NURTURE: &str = "nurture";

/// Days without engagement after which a lead is routed to reactivation.
pub const DORMANT_AFTER_DAYS: i64 = 30;

/// Inputs to template selection beyond the lead itself.
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext {
    pub interaction: Option<InteractionHint>,
    pub last_engagement_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

impl SelectionContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            interaction: None,
            last_engagement_at: None,
            now,
        }
    }

    pub fn with_interaction(mut self, hint: InteractionHint) -> Self {
        self.interaction = Some(hint);
        self
    }

    pub fn with_last_engagement(mut self, at: DateTime<Utc>) -> Self {
        self.last_engagement_at = Some(at);
        self
    }
}

/// Registry of named sequence templates.
///
/// Templates are validated once, at registration; everything resolved from
/// the catalog afterwards is known to have at least one step and strictly
/// increasing offsets. Build it, then share it behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct SequenceCatalog {
    templates: HashMap<String, SequenceTemplate>,
}

impl SequenceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog pre-loaded with the built-in templates.
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();
        for template in default_templates() {
            // Built-ins are static and known-valid.
            if let Err(e) = catalog.register(template) {
                tracing::error!(error = %e, "Built-in template rejected");
            }
        }
        info!(count = catalog.len(), "Sequence catalog loaded");
        catalog
    }

    /// Validates and stores a template.
    pub fn register(&mut self, template: SequenceTemplate) -> CampaignResult<()> {
        validate(&template)?;
        if self.templates.contains_key(&template.id) {
            return Err(CampaignError::InvalidTemplate {
                template_id: template.id,
                reason: "a template with this id is already registered".into(),
            });
        }
        info!(template_id = %template.id, steps = template.len(), "Registered sequence template");
        self.templates.insert(template.id.clone(), template);
        Ok(())
    }

    pub fn resolve(&self, template_id: &str) -> CampaignResult<&SequenceTemplate> {
        self.templates
            .get(template_id)
            .ok_or_else(|| CampaignError::not_found("template", template_id))
    }

    pub fn contains(&self, template_id: &str) -> bool {
        self.templates.contains_key(template_id)
    }

    pub fn list(&self) -> Vec<&SequenceTemplate> {
        let mut all: Vec<&SequenceTemplate> = self.templates.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Deterministic template choice for a lead.
    ///
    /// Explicit interaction hints win; otherwise a lead whose last engagement
    /// (or creation, when it never engaged) is older than
    /// [`DORMANT_AFTER_DAYS`] is reactivated, and everyone else is nurtured.
    pub fn select_template(&self, lead: &Lead, ctx: &SelectionContext) -> &'static str {
        match ctx.interaction {
            Some(InteractionHint::ColdContact) => COLD_OUTREACH,
            Some(InteractionHint::DemoInterest) => DEMO_INTEREST,
            Some(InteractionHint::PostMeeting) => POST_MEETING,
            None => {
                let reference = ctx.last_engagement_at.unwrap_or(lead.created_at);
                if ctx.now - reference > Duration::days(DORMANT_AFTER_DAYS) {
                    REACTIVATION
                } else {
                    NURTURE
                }
            }
        }
    }
}

fn validate(template: &SequenceTemplate) -> CampaignResult<()> {
    let invalid = |reason: String| CampaignError::InvalidTemplate {
        template_id: template.id.clone(),
        reason,
    };

    if template.id.trim().is_empty() {
        return Err(invalid("template id must not be empty".into()));
    }
    if template.steps.is_empty() {
        return Err(invalid("template must have at least one step".into()));
    }
    for (i, pair) in template.steps.windows(2).enumerate() {
        if pair[1].offset_days <= pair[0].offset_days {
            return Err(invalid(format!(
                "step {} offset {} is not after step {} offset {}",
                i + 1,
                pair[1].offset_days,
                i,
                pair[0].offset_days
            )));
        }
    }
    Ok(())
}

fn template(id: &str, name: &str, description: &str, steps: Vec<Step>) -> SequenceTemplate {
    SequenceTemplate {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        steps,
    }
}

fn default_templates() -> Vec<SequenceTemplate> {
    use Priority::{High, Low, Medium};
    use StepPurpose::*;

    vec![
        template(
            COLD_OUTREACH,
            "Cold Outreach",
            "Default seven-touch sequence for newly discovered contacts",
            vec![
                Step::new(0, Introduction, High),
                Step::new(3, ValueProposition, High),
                Step::new(7, SocialProof, Medium),
                Step::new(10, CaseStudy, Medium),
                Step::new(14, FollowUp, Medium),
                Step::new(18, ResourceShare, Low),
                Step::new(21, Breakup, Low),
            ],
        ),
        template(
            DEMO_INTEREST,
            "Demo Interest",
            "Short cadence for contacts who asked for a demo",
            vec![
                Step::new(0, DemoInvite, High),
                Step::new(1, ValueProposition, High),
                Step::new(3, CaseStudy, High),
                Step::new(6, FollowUp, Medium),
                Step::new(10, Breakup, Low),
            ],
        ),
        template(
            POST_MEETING,
            "Post Meeting",
            "Follow-up after a meeting took place",
            vec![
                Step::new(0, MeetingRecap, High),
                Step::new(2, ResourceShare, Medium),
                Step::new(5, CheckIn, Medium),
                Step::new(10, FollowUp, Low),
            ],
        ),
        template(
            HIGH_INTENT,
            "High Intent",
            "Accelerated sequence after a contact clicked through",
            vec![
                Step::new(0, DemoInvite, High),
                Step::new(1, CaseStudy, High),
                Step::new(3, FollowUp, High),
                Step::new(7, Breakup, Medium),
            ],
        ),
        template(
            REACTIVATION,
            "Reactivation",
            "Win-back sequence for dormant contacts",
            vec![
                Step::new(0, Reengagement, Medium),
                Step::new(5, ValueProposition, Low),
                Step::new(12, Breakup, Low),
            ],
        ),
        template(
            NURTURE,
            "Long-term Nurture",
            "Low-frequency educational touches",
            vec![
                Step::new(0, Introduction, Low),
                Step::new(14, ResourceShare, Low),
                Step::new(30, CaseStudy, Low),
                Step::new(45, SocialProof, Low),
                Step::new(60, CheckIn, Low),
                Step::new(90, Reengagement, Low),
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_core::types::LeadSource;

    fn steps(offsets: &[u32]) -> Vec<Step> {
        offsets
            .iter()
            .map(|o| Step::new(*o, StepPurpose::FollowUp, Priority::Medium))
            .collect()
    }

    #[test]
    fn test_defaults_registered() {
        let catalog = SequenceCatalog::with_defaults();
        assert_eq!(catalog.len(), 6);
        let cold = catalog.resolve(COLD_OUTREACH).unwrap();
        let offsets: Vec<u32> = cold.steps.iter().map(|s| s.offset_days).collect();
        assert_eq!(offsets, vec![0, 3, 7, 10, 14, 18, 21]);
    }

    #[test]
    fn test_resolve_unknown_is_not_found() {
        let catalog = SequenceCatalog::with_defaults();
        assert!(matches!(
            catalog.resolve("missing"),
            Err(CampaignError::NotFound { .. })
        ));
    }

    #[test]
    fn test_register_rejects_non_increasing_offsets() {
        let mut catalog = SequenceCatalog::new();
        let result = catalog.register(template("bad", "Bad", "", steps(&[0, 3, 3, 5])));
        assert!(matches!(result, Err(CampaignError::InvalidTemplate { .. })));

        let result = catalog.register(template("worse", "Worse", "", steps(&[5, 2])));
        assert!(matches!(result, Err(CampaignError::InvalidTemplate { .. })));
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_register_rejects_empty_and_duplicate() {
        let mut catalog = SequenceCatalog::new();
        assert!(catalog.register(template("empty", "Empty", "", vec![])).is_err());

        catalog.register(template("one", "One", "", steps(&[0]))).unwrap();
        let dup = catalog.register(template("one", "One again", "", steps(&[0, 1])));
        assert!(matches!(dup, Err(CampaignError::InvalidTemplate { .. })));
        assert_eq!(catalog.resolve("one").unwrap().name, "One");
    }

    #[test]
    fn test_select_template_policy() {
        let catalog = SequenceCatalog::with_defaults();
        let now = Utc::now();
        let lead = Lead::new("a@b.io".into(), LeadSource::Manual, Priority::Medium);

        let ctx = SelectionContext::new(now);
        assert_eq!(
            catalog.select_template(&lead, &ctx.with_interaction(InteractionHint::ColdContact)),
            COLD_OUTREACH
        );
        assert_eq!(
            catalog.select_template(&lead, &ctx.with_interaction(InteractionHint::DemoInterest)),
            DEMO_INTEREST
        );
        assert_eq!(
            catalog.select_template(&lead, &ctx.with_interaction(InteractionHint::PostMeeting)),
            POST_MEETING
        );
        assert_eq!(catalog.select_template(&lead, &ctx), NURTURE);

        let dormant = ctx.with_last_engagement(now - Duration::days(31));
        assert_eq!(catalog.select_template(&lead, &dormant), REACTIVATION);
        // Same inputs, same answer.
        assert_eq!(catalog.select_template(&lead, &dormant), REACTIVATION);
    }
}
