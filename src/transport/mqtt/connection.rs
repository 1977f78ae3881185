//! Connection state, reconnect policy and client options
//!
//! Pure pieces of the MQTT session: the states a connection moves through,
//! how long to wait between automatic reconnect attempts, and how a gateway
//! identity becomes rumqttc options.

use super::credentials::BrokerUrl;
use crate::config::{GatewayConfiguration, MqttSection};
use crate::protocol::TopicError;
use rumqttc::MqttOptions;
use rumqttc::Transport as NetworkTransport;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Lowest keep-alive accepted by the client, in seconds
const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// Connection state of the single broker session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session; `connect()` may be called
    Disconnected,
    /// Initial connection attempt in flight
    Connecting,
    /// Session established
    Connected,
    /// Session lost, automatic reconnect attempt number
    Reconnecting(u32),
    /// Caller-requested disconnect in flight
    Disconnecting,
    /// Resources released; terminal
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Automatic reconnection policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Delays in milliseconds for the first attempts
    pub backoff_pattern: Vec<u64>,
    /// Delay in milliseconds once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 64_000],
            sustained_delay: 128_000,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnection attempt `attempt` (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or unset for unlimited".to_string());
        }

        if self.sustained_delay == 0 {
            return Err("sustained_delay must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Topic error: {0}")]
    Topic(#[from] TopicError),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Transport is closed")]
    Closed,
    #[error("Client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("Event loop task panicked: {0}")]
    EventLoopPanicked(String),
}

impl TransportError {
    /// Expected while the session is down; reported quietly
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected { .. } | Self::Closed)
    }
}

/// Build rumqttc options for the gateway identity.
///
/// Only the stripped broker URL's host and port reach the client; credentials
/// are passed separately.
pub fn configure_mqtt_options(
    gateway: &GatewayConfiguration,
    mqtt: &MqttSection,
    broker: &BrokerUrl,
) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(gateway.client_id(), broker.host(), broker.port());

    if broker.is_tls() {
        mqtt_options.set_transport(NetworkTransport::tls_with_default_config());
    }

    if let Some(credentials) = broker.credentials() {
        mqtt_options.set_credentials(credentials.username.clone(), credentials.password.clone());
    }

    mqtt_options.set_keep_alive(Duration::from_secs(
        mqtt.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS),
    ));
    mqtt_options.set_clean_session(true);

    mqtt_options
}
