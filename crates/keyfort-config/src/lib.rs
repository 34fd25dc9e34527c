//! Keyfort configuration
//!
//! One struct carries every tunable the service reads at startup: the push
//! endpoint hostname whitelist, KDF cost, token TTL constants, lease
//! bounds, quota limits and host protocol timeouts. Values ship with
//! working defaults and can be overridden from a JSON file.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Per-lease quota limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaLimits {
    /// Tokens issued per rolling hour.
    pub tokens_per_hour: u32,
    /// Sustained sends per rolling minute.
    pub sends_per_minute: u32,
    /// Burst bucket capacity, refilled at the sustained rate.
    pub burst_capacity: u32,
    /// Sends per rolling minute per endpoint identifier.
    pub per_endpoint_per_minute: u32,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            tokens_per_hour: 100,
            sends_per_minute: 10,
            burst_capacity: 20,
            per_endpoint_per_minute: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Hostnames (and their dotted suffixes) accepted for push endpoints.
    pub endpoint_whitelist: Vec<String>,

    /// Contact claim (`sub`) stamped into issued tokens.
    pub token_contact: String,

    /// PBKDF2-SHA-256 cost for passphrase enrollment. May be raised; never
    /// lowered below the default.
    pub pbkdf2_iterations: u32,

    /// Single-issue token lifetime, seconds.
    pub token_ttl_secs: u64,
    /// First-token lifetime in a batch, seconds.
    pub batch_base_ttl_secs: u64,
    /// Per-token expiration stagger within a batch, seconds.
    pub batch_stagger_secs: u64,
    /// Hard ceiling on any token lifetime, seconds.
    pub max_token_ttl_secs: u64,
    /// Largest batch a single call may issue.
    pub max_batch_count: u32,

    /// Upper bound on lease lifetime, hours.
    pub max_lease_ttl_hours: u32,
    /// Window added by a lease extension, days.
    pub lease_extension_days: u32,

    pub quota: QuotaLimits,

    /// Host protocol timeouts, seconds.
    pub popup_timeout_secs: u64,
    pub subscription_timeout_secs: u64,
    pub notification_timeout_secs: u64,

    /// Composite setup: lease lifetime and pre-issued token count.
    pub full_setup_lease_hours: u32,
    pub full_setup_token_count: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint_whitelist: vec![
                "fcm.googleapis.com".to_string(),
                "android.googleapis.com".to_string(),
                "updates.push.services.mozilla.com".to_string(),
                "notify.windows.com".to_string(),
                "push.apple.com".to_string(),
            ],
            token_contact: "mailto:ops@keyfort.dev".to_string(),
            pbkdf2_iterations: 600_000,
            token_ttl_secs: 900,
            batch_base_ttl_secs: 6_000,
            batch_stagger_secs: 3_600,
            max_token_ttl_secs: 86_400,
            max_batch_count: 10,
            max_lease_ttl_hours: 720,
            lease_extension_days: 30,
            quota: QuotaLimits::default(),
            popup_timeout_secs: 60,
            subscription_timeout_secs: 30,
            notification_timeout_secs: 30,
            full_setup_lease_hours: 12,
            full_setup_token_count: 5,
        }
    }
}

impl Config {
    /// Load from a JSON file; absent fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_contractual() {
        let config = Config::default();
        assert_eq!(config.pbkdf2_iterations, 600_000);
        assert_eq!(config.token_ttl_secs, 900);
        assert_eq!(config.batch_base_ttl_secs, 6_000);
        assert_eq!(config.batch_stagger_secs, 3_600);
        assert_eq!(config.max_lease_ttl_hours, 720);
        assert_eq!(config.quota.tokens_per_hour, 100);
        assert_eq!(config.quota.burst_capacity, 20);
        assert!(config
            .endpoint_whitelist
            .iter()
            .any(|h| h == "fcm.googleapis.com"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"pbkdf2Iterations": 1000000}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.pbkdf2_iterations, 1_000_000);
        assert_eq!(config.token_ttl_secs, 900);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.endpoint_whitelist.push("example.test".to_string());
        config.save(&path).unwrap();

        let back = Config::load(&path).unwrap();
        assert!(back.endpoint_whitelist.iter().any(|h| h == "example.test"));
    }
}
