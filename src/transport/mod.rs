//! Transport layer for the simulated gateway
//!
//! This module provides the transport abstraction consumed by device logic and
//! its MQTT implementation.

use crate::protocol::{Message, Topic};
use std::sync::Arc;

pub mod mqtt;

/// Inbound message callback
pub type Consumer = Arc<dyn Fn(Message) + Send + Sync>;

/// Lifecycle callback
pub type Hook = Arc<dyn Fn() + Send + Sync>;

/// Transport trait for device communication
///
/// Every operation returns immediately. Outcomes of `connect`, `disconnect`,
/// `subscribe`, `unsubscribe` and `send_message` surface only through the
/// lifecycle hooks and the log; a transport that is not connected turns them
/// into logged no-ops.
///
/// Hooks and consumers run on the transport's own task and must do their own
/// synchronization.
pub trait Transport: Send + Sync {
    /// Start connecting to the broker
    fn connect(&self);

    /// Start a graceful disconnect
    fn disconnect(&self);

    /// Forcefully tear down the session and release all resources.
    ///
    /// Resources are released even if the forcible disconnect fails. Later
    /// calls to any operation are no-ops.
    fn close(&self) -> Result<(), mqtt::TransportError>;

    /// Render `topic` and register `consumer` for messages arriving on it
    fn subscribe(&self, topic: &Topic, consumer: Consumer);

    /// Render `topic` and drop its subscription
    fn unsubscribe(&self, topic: &Topic);

    /// Render `topic` and publish `payload` fire-and-forget
    fn send_message(&self, topic: &Topic, payload: &[u8]);

    /// Replace the hook invoked when a session is established
    fn when_connected(&self, hook: Hook);

    /// Replace the hook invoked when a session ends
    fn when_disconnected(&self, hook: Hook);
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttTransport;
