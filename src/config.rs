//! Simulator configuration
//!
//! One simulated gateway is configured by its identity (`[gateway]`) and the
//! settings of its MQTT session (`[mqtt]`, optional). The identity is read once
//! at startup and never changes afterwards.

use crate::transport::mqtt::connection::ReconnectConfig;
use crate::transport::mqtt::credentials::redact_user_info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Main simulator configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulatorConfig {
    pub gateway: GatewayConfiguration,
    #[serde(default)]
    pub mqtt: MqttSection,
}

/// Identity of the simulated device
///
/// The broker URL may carry `user:password` credentials; they are never shown
/// by the `Debug` output.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayConfiguration {
    account_name: String,
    client_id: String,
    broker_url: String,
}

impl GatewayConfiguration {
    pub fn new(
        account_name: impl Into<String>,
        client_id: impl Into<String>,
        broker_url: impl Into<String>,
    ) -> Self {
        Self {
            account_name: account_name.into(),
            client_id: client_id.into(),
            broker_url: broker_url.into(),
        }
    }

    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Broker URL as configured, credentials included
    pub fn broker_url(&self) -> &str {
        &self.broker_url
    }

    /// Copy of this identity with the broker password masked, for display
    pub fn redacted(&self) -> Self {
        Self {
            broker_url: redact_user_info(&self.broker_url),
            ..self.clone()
        }
    }

    /// Account name and client id each become one wire-topic level
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_identifier("account_name", &self.account_name)?;
        validate_identifier("client_id", &self.client_id)?;
        if self.broker_url.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker_url must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for GatewayConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfiguration")
            .field("account_name", &self.account_name)
            .field("client_id", &self.client_id)
            .field("broker_url", &redact_user_info(&self.broker_url))
            .finish()
    }
}

/// MQTT session settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Keep-alive interval in seconds (default: 60)
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Capacity of the client request queue (default: 10)
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
    /// Re-issue registered subscriptions after an automatic reconnect (default: true)
    #[serde(default = "default_resubscribe_on_reconnect")]
    pub resubscribe_on_reconnect: bool,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_request_capacity() -> usize {
    10
}

fn default_resubscribe_on_reconnect() -> bool {
    true
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive_secs(),
            request_capacity: default_request_capacity(),
            resubscribe_on_reconnect: default_resubscribe_on_reconnect(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl MqttSection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keep_alive_secs < 5 {
            return Err(ConfigError::InvalidConfig(format!(
                "keep_alive_secs must be at least 5, got {}",
                self.keep_alive_secs
            )));
        }
        if self.request_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "request_capacity must be greater than 0".to_string(),
            ));
        }
        self.reconnect
            .validate()
            .map_err(ConfigError::InvalidConfig)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SimulatorConfig {
    pub fn new(gateway: GatewayConfiguration) -> Self {
        Self {
            gateway,
            mqtt: MqttSection::default(),
        }
    }

    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SimulatorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gateway.validate()?;
        self.mqtt.validate()
    }

    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[gateway]
account_name = "acct1"
client_id = "dev1"
broker_url = "mqtt://localhost:1883"
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

/// Identifiers must be usable as a single MQTT topic level
fn validate_identifier(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::InvalidIdentifier(format!(
            "{field} must not be empty"
        )));
    }
    if let Some(ch) = value.chars().find(|c| matches!(c, '/' | '+' | '#' | '\0')) {
        return Err(ConfigError::InvalidIdentifier(format!(
            "{field} '{value}' contains reserved topic character {ch:?}"
        )));
    }
    Ok(())
}
