//! Mock implementations for testing
//!
//! [`MockTransport`] implements [`Transport`] in memory. It renders topics and
//! moves through the same lifecycle state machine as the MQTT transport, so
//! device logic can be tested without a broker.

use crate::config::GatewayConfiguration;
use crate::protocol::{Topic, TopicContext};
use crate::transport::mqtt::connection::{ConnectionState, TransportError};
use crate::transport::mqtt::lifecycle::{ConnectionEvent, Lifecycle, LifecycleNotice};
use crate::transport::mqtt::message_handler::SubscriptionRegistry;
use crate::transport::mqtt::lock_unpoisoned;
use crate::transport::{Consumer, Hook, Transport};
use bytes::Bytes;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

pub type PublishedMessage = (String, Vec<u8>);

/// Mock transport for testing
pub struct MockTransport {
    context: TopicContext,
    base_topic: String,
    lifecycle: Lifecycle,
    registry: SubscriptionRegistry,
    published_messages: Mutex<Vec<PublishedMessage>>,
    subscribe_requests: Mutex<Vec<String>>,
    unsubscribe_requests: Mutex<Vec<String>>,
    pub should_fail: bool,
}

impl MockTransport {
    pub fn new(gateway: &GatewayConfiguration) -> Self {
        let context = TopicContext::from_configuration(gateway);
        let base_topic = Topic::control_base()
            .render(&context)
            .unwrap_or_default();
        Self {
            context,
            base_topic,
            lifecycle: Lifecycle::new(),
            registry: SubscriptionRegistry::new(),
            published_messages: Mutex::new(Vec::new()),
            subscribe_requests: Mutex::new(Vec::new()),
            unsubscribe_requests: Mutex::new(Vec::new()),
            should_fail: false,
        }
    }

    /// Every connect attempt is refused
    pub fn with_failure(gateway: &GatewayConfiguration) -> Self {
        Self {
            should_fail: true,
            ..Self::new(gateway)
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn notices(&self) -> broadcast::Receiver<LifecycleNotice> {
        self.lifecycle.notices()
    }

    pub fn get_published_messages(&self) -> Vec<PublishedMessage> {
        lock_unpoisoned(&self.published_messages).clone()
    }

    /// Wire filters sent to the broker, in request order
    pub fn get_subscribe_requests(&self) -> Vec<String> {
        lock_unpoisoned(&self.subscribe_requests).clone()
    }

    pub fn get_unsubscribe_requests(&self) -> Vec<String> {
        lock_unpoisoned(&self.unsubscribe_requests).clone()
    }

    /// Wire filters with a registered consumer
    pub fn active_subscriptions(&self) -> Vec<String> {
        self.registry.filters()
    }

    pub fn clear_history(&self) {
        lock_unpoisoned(&self.published_messages).clear();
        lock_unpoisoned(&self.subscribe_requests).clear();
        lock_unpoisoned(&self.unsubscribe_requests).clear();
    }

    /// Deliver an inbound message as the broker would; returns the number of
    /// consumers invoked
    pub fn deliver(&self, wire_topic: &str, payload: impl Into<Bytes>) -> usize {
        if !self.lifecycle.state().is_connected() {
            return 0;
        }
        self.registry
            .dispatch(&self.base_topic, wire_topic, payload.into())
    }

    /// Drop the session as a network failure would
    pub fn simulate_connection_lost(&self, reason: &str) {
        self.lifecycle
            .apply(ConnectionEvent::ConnectionLost(reason.to_string()));
    }

    /// Complete an automatic reconnect
    pub fn simulate_reconnected(&self) {
        self.lifecycle.apply(ConnectionEvent::ReconnectionStarted(1));
        self.lifecycle.apply(ConnectionEvent::ConnAckReceived);
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        match self.lifecycle.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(TransportError::Closed),
            state => Err(TransportError::NotConnected { state }),
        }
    }

    fn try_subscribe(&self, topic: &Topic, consumer: Consumer) -> Result<(), TransportError> {
        let filter = topic.render(&self.context)?;
        self.ensure_connected()?;
        self.registry.register(filter.clone(), consumer);
        lock_unpoisoned(&self.subscribe_requests).push(filter);
        Ok(())
    }

    fn try_unsubscribe(&self, topic: &Topic) -> Result<(), TransportError> {
        let filter = topic.render(&self.context)?;
        self.registry.remove(&filter);
        self.ensure_connected()?;
        lock_unpoisoned(&self.unsubscribe_requests).push(filter);
        Ok(())
    }

    fn try_publish(&self, topic: &Topic, payload: &[u8]) -> Result<(), TransportError> {
        let wire_topic = topic.render(&self.context)?;
        self.ensure_connected()?;
        lock_unpoisoned(&self.published_messages).push((wire_topic, payload.to_vec()));
        Ok(())
    }
}

impl Transport for MockTransport {
    fn connect(&self) {
        let (_, next) = self.lifecycle.apply(ConnectionEvent::ConnectRequested);
        if next != ConnectionState::Connecting {
            return;
        }

        if self.should_fail {
            self.lifecycle.apply(ConnectionEvent::ConnectFailed(
                "Mock connection failure".to_string(),
            ));
        } else {
            self.lifecycle.apply(ConnectionEvent::ConnAckReceived);
        }
    }

    fn disconnect(&self) {
        let (_, next) = self.lifecycle.apply(ConnectionEvent::DisconnectRequested);
        if next == ConnectionState::Disconnecting {
            self.lifecycle.apply(ConnectionEvent::DisconnectCompleted);
        }
    }

    fn close(&self) -> Result<(), TransportError> {
        self.lifecycle.apply(ConnectionEvent::Closed);
        self.registry.clear();
        Ok(())
    }

    fn subscribe(&self, topic: &Topic, consumer: Consumer) {
        if let Err(e) = self.try_subscribe(topic, consumer) {
            debug!("Mock subscribe to {} failed: {}", topic, e);
        }
    }

    fn unsubscribe(&self, topic: &Topic) {
        if let Err(e) = self.try_unsubscribe(topic) {
            debug!("Mock unsubscribe from {} failed: {}", topic, e);
        }
    }

    fn send_message(&self, topic: &Topic, payload: &[u8]) {
        if let Err(e) = self.try_publish(topic, payload) {
            debug!("Mock publish to {} failed: {}", topic, e);
        }
    }

    fn when_connected(&self, hook: Hook) {
        self.lifecycle.set_on_connected(hook);
    }

    fn when_disconnected(&self, hook: Hook) {
        self.lifecycle.set_on_disconnected(hook);
    }
}
