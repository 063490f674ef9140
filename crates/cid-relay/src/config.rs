// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address to bind the panel-facing listener to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP port panels connect to (default: 20005)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Monitoring host to forward rewritten frames to
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,

    /// Monitoring host TCP port (default: 20004)
    #[serde(default = "default_upstream_port")]
    pub upstream_port: u16,

    /// Initial reconnect backoff in seconds
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_secs: u64,

    /// Reconnect backoff cap in seconds
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_secs: u64,

    /// Forward queue capacity (messages)
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Frame rewrite rules
    #[serde(default)]
    pub rules: RewriteRulesConfig,

    /// Devices idle longer than this are swept from the registry (seconds)
    #[serde(default = "default_inactivity_threshold")]
    pub inactivity_threshold_secs: u64,

    /// Inactive-device sweep period (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Rewrite rules as they appear in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteRulesConfig {
    /// Single character every non-heartbeat frame must begin with
    #[serde(default = "default_required_prefix")]
    pub required_prefix: String,

    /// Exact decoded frame length for non-heartbeat frames
    #[serde(default = "default_valid_length")]
    pub valid_length: usize,

    /// Inclusive account window the shift applies to
    #[serde(default = "default_account_window")]
    pub account_window: [u32; 2],

    /// Signed shift added to accounts inside the window
    #[serde(default = "default_account_shift")]
    pub account_shift: i32,

    /// Event-code substitutions applied to data frames
    #[serde(default = "default_event_code_map")]
    pub event_code_map: HashMap<String, String>,
}

fn default_bind_address() -> IpAddr {
    "0.0.0.0".parse().unwrap()
}

fn default_port() -> u16 {
    20005
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_upstream_port() -> u16 {
    20004
}

fn default_reconnect_initial() -> u64 {
    1
}

fn default_reconnect_max() -> u64 {
    60
}

fn default_queue_size() -> usize {
    100
}

fn default_required_prefix() -> String {
    "5".to_string()
}

fn default_valid_length() -> usize {
    20
}

fn default_account_window() -> [u32; 2] {
    [2000, 2200]
}

fn default_account_shift() -> i32 {
    2100
}

fn default_event_code_map() -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert("E603".to_string(), "E602".to_string());
    map
}

fn default_inactivity_threshold() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    300
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            upstream_host: default_upstream_host(),
            upstream_port: default_upstream_port(),
            reconnect_initial_secs: default_reconnect_initial(),
            reconnect_max_secs: default_reconnect_max(),
            queue_size: default_queue_size(),
            rules: RewriteRulesConfig::default(),
            inactivity_threshold_secs: default_inactivity_threshold(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for RewriteRulesConfig {
    fn default() -> Self {
        Self {
            required_prefix: default_required_prefix(),
            valid_length: default_valid_length(),
            account_window: default_account_window(),
            account_shift: default_account_shift(),
            event_code_map: default_event_code_map(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Get initial reconnect backoff as Duration.
    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_secs(self.reconnect_initial_secs)
    }

    /// Get reconnect backoff cap as Duration.
    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs)
    }

    /// Get the device inactivity threshold as Duration.
    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_secs(self.inactivity_threshold_secs)
    }

    /// Get the inactive-device sweep period as Duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue("port cannot be 0".into()));
        }
        if self.upstream_port == 0 {
            return Err(ConfigError::InvalidValue(
                "upstream_port cannot be 0".into(),
            ));
        }
        if self.upstream_host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "upstream_host cannot be empty".into(),
            ));
        }
        if self.queue_size == 0 {
            return Err(ConfigError::InvalidValue("queue_size cannot be 0".into()));
        }
        if self.reconnect_initial_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "reconnect_initial_secs cannot be 0".into(),
            ));
        }
        if self.reconnect_max_secs < self.reconnect_initial_secs {
            return Err(ConfigError::InvalidValue(
                "reconnect_max_secs cannot be below reconnect_initial_secs".into(),
            ));
        }
        if self.rules.required_prefix.len() != 1 {
            return Err(ConfigError::InvalidValue(
                "required_prefix must be a single character".into(),
            ));
        }
        if self.rules.valid_length == 0 {
            return Err(ConfigError::InvalidValue(
                "valid_length cannot be 0".into(),
            ));
        }
        if self.rules.account_window[0] > self.rules.account_window[1] {
            return Err(ConfigError::InvalidValue(
                "account_window low bound exceeds high bound".into(),
            ));
        }
        for (from, to) in &self.rules.event_code_map {
            if from.len() != 4 || to.len() != 4 {
                return Err(ConfigError::InvalidValue(format!(
                    "event_code_map entry '{}' -> '{}': codes must be 4 characters",
                    from, to
                )));
            }
        }
        if self.inactivity_threshold_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "inactivity_threshold_secs cannot be 0".into(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "sweep_interval_secs cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, Clone)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoError(s) => write!(f, "I/O error: {}", s),
            Self::ParseError(s) => write!(f, "Parse error: {}", s),
            Self::InvalidValue(s) => write!(f, "Invalid value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 20005);
        assert_eq!(config.upstream_port, 20004);
        assert_eq!(config.queue_size, 100);
        assert_eq!(config.rules.valid_length, 20);
        assert_eq!(config.rules.account_window, [2000, 2200]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = RelayConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RelayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.port, parsed.port);
        assert_eq!(config.rules.account_shift, parsed.rules.account_shift);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: RelayConfig = serde_json::from_str(r#"{"port": 9000}"#).unwrap();
        assert_eq!(parsed.port, 9000);
        assert_eq!(parsed.queue_size, 100);
        assert_eq!(
            parsed.rules.event_code_map.get("E603").map(String::as_str),
            Some("E602")
        );
    }

    #[test]
    fn test_validation_port_zero() {
        let config = RelayConfig {
            port: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_queue_size_zero() {
        let config = RelayConfig {
            queue_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_backoff_order() {
        let config = RelayConfig {
            reconnect_initial_secs: 30,
            reconnect_max_secs: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_prefix_length() {
        let mut config = RelayConfig::default();
        config.rules.required_prefix = "55".to_string();
        assert!(config.validate().is_err());

        config.rules.required_prefix = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_account_window_order() {
        let mut config = RelayConfig::default();
        config.rules.account_window = [2200, 2000];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_event_code_width() {
        let mut config = RelayConfig::default();
        config
            .rules
            .event_code_map
            .insert("E603".to_string(), "E60".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_accessors() {
        let config = RelayConfig {
            reconnect_initial_secs: 2,
            reconnect_max_secs: 120,
            inactivity_threshold_secs: 1800,
            sweep_interval_secs: 60,
            ..Default::default()
        };
        assert_eq!(config.reconnect_initial(), Duration::from_secs(2));
        assert_eq!(config.reconnect_max(), Duration::from_secs(120));
        assert_eq!(config.inactivity_threshold(), Duration::from_secs(1800));
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
    }
}
