use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::EngineError;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub actions: ActionsConfig,
}

#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    /// LND REST endpoint, e.g. "https://127.0.0.1:8080"
    pub rest_url: String,
    /// Path to a macaroon with read access (readonly.macaroon suffices)
    pub macaroon_path: PathBuf,
    /// Path to LND's self-signed TLS certificate
    pub tls_cert_path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Delay between a node event and the refresh it schedules, seconds.
    /// Bursts of events within the delay collapse into one refresh.
    #[serde(default = "default_refresh_debounce")]
    pub refresh_debounce_secs: u64,
    /// Backoff before reconnecting a dropped event subscription, seconds
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
}

/// Tunables of the advisory engine. Every bound is enforced by
/// `validate()`; the engine refuses to construct otherwise.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionsConfig {
    /// Length of the event window, days
    #[serde(default = "default_days")]
    pub days: u32,
    /// Forwards needed before flow predicts a balance target
    #[serde(default = "default_min_channel_forwards")]
    pub min_channel_forwards: u32,
    /// Capacity fraction recent outbound forwards must sum to before their
    /// implied fee rate is trusted
    #[serde(default = "default_min_out_fee_forward_fraction")]
    pub min_out_fee_forward_fraction: f64,
    /// Balance floor and ceiling as a fraction of capacity, in (0, 0.5)
    #[serde(default = "default_min_channel_balance_fraction")]
    pub min_channel_balance_fraction: f64,
    /// Minimum |distance| before a balance action is emitted, in (0, 1]
    #[serde(default = "default_min_rebalance_distance")]
    pub min_rebalance_distance: f64,
    /// Headroom above the largest observed forward in each direction
    #[serde(default = "default_largest_forward_margin_fraction")]
    pub largest_forward_margin_fraction: f64,
    /// |distance| beyond which fee increases kick in; must exceed
    /// min_rebalance_distance
    #[serde(default = "default_min_fee_increase_distance")]
    pub min_fee_increase_distance: f64,
    /// Scales how fast older depletions raise fees, >= 1
    #[serde(default = "default_fee_increase_multiplier")]
    pub fee_increase_multiplier: f64,
    /// Idle days before fee decreases begin, in [0, days)
    #[serde(default = "default_fee_decrease_wait_days")]
    pub fee_decrease_wait_days: u32,
    /// Inflow share above which rebalance cost no longer floors decreases
    #[serde(default = "default_min_inflow_fraction")]
    pub min_inflow_fraction: f64,
    /// Absolute fee-rate cap, ppm, > 0
    #[serde(default = "default_max_fee_rate")]
    pub max_fee_rate: u32,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}
fn default_refresh_debounce() -> u64 {
    10
}
fn default_retry_backoff() -> u64 {
    10
}
fn default_days() -> u32 {
    30
}
fn default_min_channel_forwards() -> u32 {
    20
}
fn default_min_out_fee_forward_fraction() -> f64 {
    0.01
}
fn default_min_channel_balance_fraction() -> f64 {
    0.25
}
fn default_min_rebalance_distance() -> f64 {
    0.05
}
fn default_largest_forward_margin_fraction() -> f64 {
    0.1
}
fn default_min_fee_increase_distance() -> f64 {
    0.3
}
fn default_fee_increase_multiplier() -> f64 {
    3.0
}
fn default_fee_decrease_wait_days() -> u32 {
    4
}
fn default_min_inflow_fraction() -> f64 {
    0.3
}
fn default_max_fee_rate() -> u32 {
    2500
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            refresh_debounce_secs: default_refresh_debounce(),
            retry_backoff_secs: default_retry_backoff(),
        }
    }
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            days: default_days(),
            min_channel_forwards: default_min_channel_forwards(),
            min_out_fee_forward_fraction: default_min_out_fee_forward_fraction(),
            min_channel_balance_fraction: default_min_channel_balance_fraction(),
            min_rebalance_distance: default_min_rebalance_distance(),
            largest_forward_margin_fraction: default_largest_forward_margin_fraction(),
            min_fee_increase_distance: default_min_fee_increase_distance(),
            fee_increase_multiplier: default_fee_increase_multiplier(),
            fee_decrease_wait_days: default_fee_decrease_wait_days(),
            min_inflow_fraction: default_min_inflow_fraction(),
            max_fee_rate: default_max_fee_rate(),
        }
    }
}

impl ActionsConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.days == 0 {
            return Err(EngineError::Config("days must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.min_out_fee_forward_fraction) {
            return Err(EngineError::Config(format!(
                "min_out_fee_forward_fraction ({}) must be within [0, 1]",
                self.min_out_fee_forward_fraction
            )));
        }
        if self.min_channel_balance_fraction <= 0.0 || self.min_channel_balance_fraction >= 0.5 {
            return Err(EngineError::Config(format!(
                "min_channel_balance_fraction ({}) must be within (0, 0.5)",
                self.min_channel_balance_fraction
            )));
        }
        if self.min_rebalance_distance <= 0.0 || self.min_rebalance_distance > 1.0 {
            return Err(EngineError::Config(format!(
                "min_rebalance_distance ({}) must be within (0, 1]",
                self.min_rebalance_distance
            )));
        }
        if self.largest_forward_margin_fraction < 0.0 {
            return Err(EngineError::Config(format!(
                "largest_forward_margin_fraction ({}) must not be negative",
                self.largest_forward_margin_fraction
            )));
        }
        if self.min_fee_increase_distance <= self.min_rebalance_distance
            || self.min_fee_increase_distance > 1.0
        {
            return Err(EngineError::Config(format!(
                "min_fee_increase_distance ({}) must be within (min_rebalance_distance, 1]",
                self.min_fee_increase_distance
            )));
        }
        if self.fee_increase_multiplier < 1.0 {
            return Err(EngineError::Config(format!(
                "fee_increase_multiplier ({}) must be at least 1",
                self.fee_increase_multiplier
            )));
        }
        if self.fee_decrease_wait_days >= self.days {
            return Err(EngineError::Config(format!(
                "fee_decrease_wait_days ({}) must be below days ({})",
                self.fee_decrease_wait_days, self.days
            )));
        }
        if !(0.0..=1.0).contains(&self.min_inflow_fraction) {
            return Err(EngineError::Config(format!(
                "min_inflow_fraction ({}) must be within [0, 1]",
                self.min_inflow_fraction
            )));
        }
        if self.max_fee_rate == 0 {
            return Err(EngineError::Config(
                "max_fee_rate must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.actions.validate()?;
        if !self.node.macaroon_path.exists() {
            anyhow::bail!(
                "Macaroon not found at: {}",
                self.node.macaroon_path.display()
            );
        }
        if !self.node.tls_cert_path.exists() {
            anyhow::bail!(
                "TLS cert not found at: {}",
                self.node.tls_cert_path.display()
            );
        }
        Ok(())
    }

    /// Create a config with all defaults for testing purposes.
    /// The credential paths must exist for validation.
    #[cfg(test)]
    pub fn test_default(credential_path: PathBuf) -> Self {
        Self {
            node: NodeConfig {
                rest_url: "https://127.0.0.1:8080".to_string(),
                macaroon_path: credential_path.clone(),
                tls_cert_path: credential_path,
            },
            general: GeneralConfig::default(),
            actions: ActionsConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_valid_config() -> Config {
        // Use /dev/null as a path that always exists on macOS/Linux
        Config::test_default(PathBuf::from("/dev/null"))
    }

    #[test]
    fn test_validate_defaults_pass() {
        let config = make_valid_config();
        assert!(config.validate().is_ok(), "{}", config.validate().unwrap_err());
    }

    #[test]
    fn test_validate_zero_days() {
        let mut config = make_valid_config();
        config.actions.days = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("days"));
    }

    #[test]
    fn test_validate_balance_fraction_bounds() {
        let mut config = make_valid_config();
        config.actions.min_channel_balance_fraction = 0.5;
        assert!(config.validate().is_err());

        let mut config = make_valid_config();
        config.actions.min_channel_balance_fraction = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rebalance_distance_bounds() {
        let mut config = make_valid_config();
        config.actions.min_rebalance_distance = 0.0;
        assert!(config.validate().is_err());

        let mut config = make_valid_config();
        config.actions.min_rebalance_distance = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_increase_distance_must_exceed_rebalance_distance() {
        let mut config = make_valid_config();
        config.actions.min_fee_increase_distance = config.actions.min_rebalance_distance;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_fee_increase_distance"));
    }

    #[test]
    fn test_validate_multiplier_below_one() {
        let mut config = make_valid_config();
        config.actions.fee_increase_multiplier = 0.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("fee_increase_multiplier"));
    }

    #[test]
    fn test_validate_wait_days_must_be_below_window() {
        let mut config = make_valid_config();
        config.actions.fee_decrease_wait_days = 30;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("fee_decrease_wait_days"));
    }

    #[test]
    fn test_validate_zero_max_fee_rate() {
        let mut config = make_valid_config();
        config.actions.max_fee_rate = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_fee_rate"));
    }

    #[test]
    fn test_validate_missing_macaroon() {
        let mut config = make_valid_config();
        config.node.macaroon_path = PathBuf::from("/nonexistent/admin.macaroon");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Macaroon not found"));
    }

    #[test]
    fn test_toml_deserialize_minimal() {
        let toml_str = r#"
[node]
rest_url = "https://127.0.0.1:8080"
macaroon_path = "/tmp/readonly.macaroon"
tls_cert_path = "/tmp/tls.cert"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node.rest_url, "https://127.0.0.1:8080");
        // Defaults should be applied
        assert_eq!(config.general.refresh_debounce_secs, 10);
        assert_eq!(config.actions.days, 30);
        assert_eq!(config.actions.min_channel_forwards, 20);
        assert_eq!(config.actions.max_fee_rate, 2500);
        assert!(config.actions.validate().is_ok());
    }

    #[test]
    fn test_toml_overrides_actions() {
        let toml_str = r#"
[node]
rest_url = "https://127.0.0.1:8080"
macaroon_path = "/tmp/readonly.macaroon"
tls_cert_path = "/tmp/tls.cert"

[actions]
days = 14
fee_decrease_wait_days = 2
max_fee_rate = 5000
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.actions.days, 14);
        assert_eq!(config.actions.fee_decrease_wait_days, 2);
        assert_eq!(config.actions.max_fee_rate, 5000);
        // Untouched fields keep their defaults
        assert_eq!(config.actions.min_rebalance_distance, 0.05);
    }
}
