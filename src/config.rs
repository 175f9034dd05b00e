//! Control-plane configuration.
//!
//! ## Environment
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `MASTERCHEF_EVENT_LOG_CAPACITY` | `event_log_capacity` | 10000 |
//! | `MASTERCHEF_EVENT_SUBSCRIBER_BUFFER` | `event_subscriber_buffer` | 256 |
//! | `MASTERCHEF_DELIVERY_HISTORY` | `delivery_history_capacity` | 5000 |
//! | `MASTERCHEF_DEAD_LETTER_CAPACITY` | `dead_letter_capacity` | 1000 |
//! | `MASTERCHEF_WEBHOOK_TIMEOUT_SECS` | `webhook_timeout_secs` | 3 |
//! | `MASTERCHEF_VARIABLE_SOURCE_TIMEOUT_SECS` | `variable_source_timeout_secs` | 8 |
//! | `MASTERCHEF_VARS_DIR` | `encrypted_variables_dir` | unset |
//! | `MASTERCHEF_VARS_PASSPHRASE` | `encrypted_variables_passphrase` | unset |
//!
//! Unparsable numbers fall back to the default with a warning.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tunables for [`crate::plane::ControlPlane`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Events retained by the log.
    pub event_log_capacity: usize,
    /// Per-subscriber channel buffer.
    pub event_subscriber_buffer: usize,
    /// Webhook and notification deliveries retained.
    pub delivery_history_capacity: usize,
    /// Rejected commands retained.
    pub dead_letter_capacity: usize,
    /// Webhook and notification POST timeout.
    pub webhook_timeout_secs: u64,
    /// HTTP variable source timeout.
    pub variable_source_timeout_secs: u64,
    /// Root of the encrypted variable store; unset disables it.
    pub encrypted_variables_dir: Option<PathBuf>,
    /// Passphrase for the encrypted variable store.
    #[serde(skip_serializing)]
    pub encrypted_variables_passphrase: Option<String>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            event_log_capacity: 10_000,
            event_subscriber_buffer: 256,
            delivery_history_capacity: 5_000,
            dead_letter_capacity: 1_000,
            webhook_timeout_secs: 3,
            variable_source_timeout_secs: 8,
            encrypted_variables_dir: None,
            encrypted_variables_passphrase: None,
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, var: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match lookup(var) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var, value = %raw, default = %default, "invalid value, using default");
            default
        }),
    }
}

impl ControlPlaneConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read configuration through `lookup`, which maps a variable name to its
    /// value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_blank = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let encrypted_variables_dir = non_blank("MASTERCHEF_VARS_DIR").map(PathBuf::from);
        let encrypted_variables_passphrase = lookup("MASTERCHEF_VARS_PASSPHRASE").filter(|v| !v.is_empty());
        if encrypted_variables_dir.is_some() && encrypted_variables_passphrase.is_none() {
            tracing::warn!("MASTERCHEF_VARS_DIR set without MASTERCHEF_VARS_PASSPHRASE");
        }
        Self {
            event_log_capacity: parse_or(&lookup, "MASTERCHEF_EVENT_LOG_CAPACITY", defaults.event_log_capacity),
            event_subscriber_buffer: parse_or(
                &lookup,
                "MASTERCHEF_EVENT_SUBSCRIBER_BUFFER",
                defaults.event_subscriber_buffer,
            ),
            delivery_history_capacity: parse_or(
                &lookup,
                "MASTERCHEF_DELIVERY_HISTORY",
                defaults.delivery_history_capacity,
            ),
            dead_letter_capacity: parse_or(&lookup, "MASTERCHEF_DEAD_LETTER_CAPACITY", defaults.dead_letter_capacity),
            webhook_timeout_secs: parse_or(&lookup, "MASTERCHEF_WEBHOOK_TIMEOUT_SECS", defaults.webhook_timeout_secs),
            variable_source_timeout_secs: parse_or(
                &lookup,
                "MASTERCHEF_VARIABLE_SOURCE_TIMEOUT_SECS",
                defaults.variable_source_timeout_secs,
            ),
            encrypted_variables_dir,
            encrypted_variables_passphrase,
        }
    }

    /// Reject zero capacities and timeouts, and a store directory without a
    /// passphrase.
    pub fn validate(&self) -> Result<()> {
        let capacities = [
            ("event_log_capacity", self.event_log_capacity),
            ("event_subscriber_buffer", self.event_subscriber_buffer),
            ("delivery_history_capacity", self.delivery_history_capacity),
            ("dead_letter_capacity", self.dead_letter_capacity),
        ];
        for (field, value) in capacities {
            if value == 0 {
                return Err(Error::validation(format!("{field} must be > 0")));
            }
        }
        for (field, value) in [
            ("webhook_timeout_secs", self.webhook_timeout_secs),
            ("variable_source_timeout_secs", self.variable_source_timeout_secs),
        ] {
            if value == 0 {
                return Err(Error::validation(format!("{field} must be > 0")));
            }
        }
        if self.encrypted_variables_dir.is_some() && self.encrypted_variables_passphrase.is_none() {
            return Err(Error::validation(
                "encrypted_variables_passphrase is required when encrypted_variables_dir is set",
            ));
        }
        Ok(())
    }

    /// Webhook and notification timeout.
    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }

    /// HTTP variable source timeout.
    pub fn variable_source_timeout(&self) -> Duration {
        Duration::from_secs(self.variable_source_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ControlPlaneConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.webhook_timeout(), Duration::from_secs(3));
        assert_eq!(config.variable_source_timeout(), Duration::from_secs(8));
    }

    #[test]
    fn test_from_lookup_parses_and_falls_back() {
        let config = ControlPlaneConfig::from_lookup(lookup(&[
            ("MASTERCHEF_EVENT_LOG_CAPACITY", "500"),
            ("MASTERCHEF_WEBHOOK_TIMEOUT_SECS", "ten"),
            ("MASTERCHEF_VARS_DIR", "/var/lib/masterchef/vars"),
            ("MASTERCHEF_VARS_PASSPHRASE", "pw"),
        ]));
        assert_eq!(config.event_log_capacity, 500);
        assert_eq!(config.webhook_timeout_secs, 3);
        assert_eq!(config.encrypted_variables_dir, Some(PathBuf::from("/var/lib/masterchef/vars")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zeroes() {
        let config = ControlPlaneConfig { event_log_capacity: 0, ..Default::default() };
        assert_eq!(config.validate().unwrap_err().to_string(), "event_log_capacity must be > 0");
        let config = ControlPlaneConfig { variable_source_timeout_secs: 0, ..Default::default() };
        assert!(config.validate().is_err());
        let config = ControlPlaneConfig {
            encrypted_variables_dir: Some(PathBuf::from("/tmp/x")),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_passphrase_is_never_serialized() {
        let config = ControlPlaneConfig {
            encrypted_variables_passphrase: Some("hunter2".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
    }
}
