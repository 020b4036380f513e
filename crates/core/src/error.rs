use thiserror::Error;
use uuid::Uuid;

pub type CampaignResult<T> = Result<T, CampaignError>;

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid template '{template_id}': {reason}")]
    InvalidTemplate { template_id: String, reason: String },

    #[error("Duplicate {kind}: {id}")]
    Duplicate { kind: &'static str, id: String },

    #[error("Invalid lead: {0}")]
    InvalidLead(String),

    #[error("Transient provider error ({provider}): {message}")]
    TransientProvider { provider: String, message: String },

    #[error("Permanent delivery error: {0}")]
    PermanentDelivery(String),

    #[error("Action '{action}' rejected for sequence {instance_id} in status {status}")]
    ConcurrencyViolation {
        instance_id: Uuid,
        status: String,
        action: String,
    },

    #[error("Campaign is already running")]
    AlreadyRunning,

    #[error("Campaign is not running")]
    NotRunning,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CampaignError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        CampaignError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether the error should be retried on a later tick rather than
    /// surfaced as a terminal outcome.
    pub fn is_transient(&self) -> bool {
        matches!(self, CampaignError::TransientProvider { .. })
    }
}

/// Failure reported by a discovery, personalization or engagement provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider rejected request: {0}")]
    Rejected(String),
}

/// Failure reported by the mail delivery provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Retryable failure (timeouts, throttling, transport errors).
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// Hard bounce. The address must not be contacted again.
    #[error("hard bounce: {0}")]
    HardBounce(String),
}

impl DeliveryError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, DeliveryError::HardBounce(_))
    }
}

impl From<DeliveryError> for CampaignError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::Transient(message) => CampaignError::TransientProvider {
                provider: "delivery".to_string(),
                message,
            },
            DeliveryError::HardBounce(message) => CampaignError::PermanentDelivery(message),
        }
    }
}

impl ProviderError {
    pub fn into_campaign_error(self, provider: &str) -> CampaignError {
        CampaignError::TransientProvider {
            provider: provider.to_string(),
            message: self.to_string(),
        }
    }
}
