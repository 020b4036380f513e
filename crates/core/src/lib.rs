pub mod config;
pub mod error;
pub mod event_bus;
pub mod schedule;
pub mod types;

pub use config::{AppConfig, CampaignConfig};
pub use error::{CampaignError, CampaignResult, DeliveryError, ProviderError};
pub use schedule::SendTimePlanner;
