use serde::{Deserialize, Serialize};

use crate::error::{CampaignError, CampaignResult};

/// Root application configuration. Loaded from environment variables
/// with the prefix `CAMPAIGN_OUTREACH__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub campaign: CampaignConfig,
    #[serde(default)]
    pub local: LocalProvidersConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Settings for the bundled dry-run providers used by the binary.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalProvidersConfig {
    /// JSON file holding an array of raw leads served by the local discovery provider.
    #[serde(default)]
    pub leads_file: Option<String>,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            campaign: CampaignConfig::default(),
            local: LocalProvidersConfig::default(),
        }
    }
}

// ─── Campaign Config ────────────────────────────────────────────────────

/// Per-run engine configuration, snapshotted into each `CampaignRun`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignConfig {
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
    #[serde(default = "default_dispatch_interval_secs")]
    pub dispatch_interval_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Upper bound on instances dispatched per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Hours of day (in the campaign's local offset) during which sends may land.
    #[serde(default = "default_send_window_hours")]
    pub send_window_hours: Vec<u32>,
    /// Windows starting at or after this hour are never used.
    #[serde(default = "default_cutoff_hour")]
    pub cutoff_hour: u32,
    #[serde(default = "default_max_jitter_minutes")]
    pub max_jitter_minutes: u32,
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_spacing_min_secs")]
    pub spacing_min_secs: u64,
    #[serde(default = "default_spacing_max_secs")]
    pub spacing_max_secs: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_reactivation_cooldown_days")]
    pub reactivation_cooldown_days: i64,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// How long a duplicate guarded call waits for the in-flight one. 0 returns at once.
    #[serde(default)]
    pub dedup_wait_ms: u64,
    #[serde(default)]
    pub min_lead_score: f32,
    #[serde(default)]
    pub discovery_seeds: Vec<String>,
    #[serde(default)]
    pub auto_reply_enabled: bool,
    #[serde(default = "default_sender_address")]
    pub sender_address: String,
}

fn default_discovery_interval_secs() -> u64 { 30 * 60 }
fn default_dispatch_interval_secs() -> u64 { 15 * 60 }
fn default_poll_interval_secs() -> u64 { 5 * 60 }
fn default_batch_size() -> usize { 50 }
fn default_send_window_hours() -> Vec<u32> { vec![9, 10, 11, 14, 15, 16] }
fn default_cutoff_hour() -> u32 { 17 }
fn default_max_jitter_minutes() -> u32 { 59 }
fn default_spacing_min_secs() -> u64 { 5 }
fn default_spacing_max_secs() -> u64 { 15 }
fn default_max_consecutive_failures() -> u32 { 3 }
/// Upper bound for day-valued settings, one hundred years.
pub const MAX_DAYS: i64 = 36_500;

fn default_reactivation_cooldown_days() -> i64 { 30 }
fn default_retention_days() -> i64 { 90 }
fn default_sender_address() -> String { "outreach@localhost".to_string() }

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            discovery_interval_secs: default_discovery_interval_secs(),
            dispatch_interval_secs: default_dispatch_interval_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            batch_size: default_batch_size(),
            send_window_hours: default_send_window_hours(),
            cutoff_hour: default_cutoff_hour(),
            max_jitter_minutes: default_max_jitter_minutes(),
            utc_offset_minutes: 0,
            spacing_min_secs: default_spacing_min_secs(),
            spacing_max_secs: default_spacing_max_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            reactivation_cooldown_days: default_reactivation_cooldown_days(),
            retention_days: default_retention_days(),
            dedup_wait_ms: 0,
            min_lead_score: 0.0,
            discovery_seeds: Vec::new(),
            auto_reply_enabled: false,
            sender_address: default_sender_address(),
        }
    }
}

impl CampaignConfig {
    /// Rejects configurations the scheduler cannot honor.
    pub fn validate(&self) -> CampaignResult<()> {
        if self.send_window_hours.is_empty() {
            return Err(CampaignError::Config("send_window_hours must not be empty".into()));
        }
        if let Some(h) = self.send_window_hours.iter().find(|h| **h > 23) {
            return Err(CampaignError::Config(format!("send window hour {h} is out of range")));
        }
        if !self.send_window_hours.iter().any(|h| *h < self.cutoff_hour) {
            return Err(CampaignError::Config(format!(
                "no send window opens before cutoff hour {}",
                self.cutoff_hour
            )));
        }
        if self.max_jitter_minutes > 59 {
            return Err(CampaignError::Config("max_jitter_minutes must be at most 59".into()));
        }
        if self.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(CampaignError::Config("utc_offset_minutes must be within one day".into()));
        }
        if self.spacing_min_secs > self.spacing_max_secs {
            return Err(CampaignError::Config(
                "spacing_min_secs must not exceed spacing_max_secs".into(),
            ));
        }
        if self.max_consecutive_failures == 0 {
            return Err(CampaignError::Config("max_consecutive_failures must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(CampaignError::Config("batch_size must be positive".into()));
        }
        if self.discovery_interval_secs == 0
            || self.dispatch_interval_secs == 0
            || self.poll_interval_secs == 0
        {
            return Err(CampaignError::Config("loop intervals must be positive".into()));
        }
        for (name, days) in [
            ("reactivation_cooldown_days", self.reactivation_cooldown_days),
            ("retention_days", self.retention_days),
        ] {
            if !(0..=MAX_DAYS).contains(&days) {
                return Err(CampaignError::Config(format!(
                    "{name} must be between 0 and {MAX_DAYS}, got {days}"
                )));
            }
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file overlaid with environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("CAMPAIGN_OUTREACH")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("campaign.send_window_hours")
                .with_list_parse_key("campaign.discovery_seeds"),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_campaign_config_is_valid() {
        let config = CampaignConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.send_window_hours, vec![9, 10, 11, 14, 15, 16]);
        assert_eq!(config.max_consecutive_failures, 3);
    }

    #[test]
    fn test_rejects_windows_after_cutoff() {
        let config = CampaignConfig {
            send_window_hours: vec![18, 19],
            cutoff_hour: 17,
            ..CampaignConfig::default()
        };
        assert!(matches!(config.validate(), Err(CampaignError::Config(_))));
    }

    #[test]
    fn test_rejects_inverted_spacing() {
        let config = CampaignConfig {
            spacing_min_secs: 20,
            spacing_max_secs: 10,
            ..CampaignConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_day_settings_out_of_range() {
        for (cooldown, retention) in [(-1, 90), (30, -5), (i64::MAX, 90), (30, MAX_DAYS + 1)] {
            let config = CampaignConfig {
                reactivation_cooldown_days: cooldown,
                retention_days: retention,
                ..CampaignConfig::default()
            };
            assert!(
                matches!(config.validate(), Err(CampaignError::Config(_))),
                "cooldown {cooldown} retention {retention} accepted"
            );
        }

        let longest = CampaignConfig {
            reactivation_cooldown_days: 0,
            retention_days: MAX_DAYS,
            ..CampaignConfig::default()
        };
        assert!(longest.validate().is_ok());
    }

    #[test]
    fn test_campaign_config_deserializes_with_defaults() {
        let config: CampaignConfig =
            serde_json::from_str(r#"{"batch_size": 5, "discovery_seeds": ["rust cto"]}"#).unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.dispatch_interval_secs, 900);
        assert_eq!(config.discovery_seeds, vec!["rust cto".to_string()]);
    }
}
