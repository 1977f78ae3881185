//! Impure I/O operations for the MQTT transport
//!
//! [`MqttTransport`] owns one rumqttc session. Public operations never block:
//! they queue requests on the [`AsyncClient`] with the `try_*` calls and
//! return, while a spawned event-loop task drives the socket, applies
//! lifecycle events and dispatches inbound publishes.

use super::connection::{configure_mqtt_options, ConnectionState, TransportError};
use super::credentials::BrokerUrl;
use super::lifecycle::{
    should_attempt_reconnection, ConnectionEvent, Lifecycle, LifecycleNotice,
    ReconnectionDecision,
};
use super::message_handler::{EventRoute, MessageHandler, SubscriptionRegistry};
use super::{lock_unpoisoned, read_unpoisoned, write_unpoisoned};
use crate::config::{GatewayConfiguration, MqttSection, SimulatorConfig};
use crate::protocol::{Topic, TopicContext};
use crate::transport::{Consumer, Hook, Transport};
use crate::{lifecycle_span, mqtt_span};
use futures::FutureExt;
use rumqttc::{AsyncClient, ConnectionError, EventLoop, MqttOptions, QoS, SubscribeFilter};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Running event-loop task and its shutdown signal
struct Session {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// State shared between the transport handle and its event-loop task
struct Shared {
    gateway: GatewayConfiguration,
    context: TopicContext,
    base_topic: String,
    broker: BrokerUrl,
    options: MqttOptions,
    mqtt: MqttSection,
    client: RwLock<AsyncClient>,
    pending_event_loop: Mutex<Option<EventLoop>>,
    lifecycle: Lifecycle,
    registry: SubscriptionRegistry,
    session: Mutex<Option<Session>>,
    /// Runtime the transport was built on, for calls from plain threads
    runtime: Option<Handle>,
}

/// rumqttc-backed [`Transport`] for one simulated gateway
pub struct MqttTransport {
    shared: Arc<Shared>,
}

impl MqttTransport {
    /// Build the transport for `config.gateway`.
    ///
    /// A malformed broker URL is fatal here; everything later is reported
    /// through hooks and logs.
    pub fn new(config: &SimulatorConfig) -> Result<Self, TransportError> {
        let broker = BrokerUrl::parse(config.gateway.broker_url())?;
        let options = configure_mqtt_options(&config.gateway, &config.mqtt, &broker);
        let context = TopicContext::from_configuration(&config.gateway);
        let base_topic = Topic::control_base().render(&context)?;

        let (client, event_loop) =
            AsyncClient::new(options.clone(), config.mqtt.request_capacity.max(1));

        info!(
            broker = %broker,
            client_id = %config.gateway.client_id(),
            "MQTT transport created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                gateway: config.gateway.clone(),
                context,
                base_topic,
                broker,
                options,
                mqtt: config.mqtt.clone(),
                client: RwLock::new(client),
                pending_event_loop: Mutex::new(Some(event_loop)),
                lifecycle: Lifecycle::new(),
                registry: SubscriptionRegistry::new(),
                session: Mutex::new(None),
                runtime: Handle::try_current().ok(),
            }),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lifecycle.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.lifecycle.watch_state()
    }

    /// Lifecycle notifications for any number of observers
    pub fn notices(&self) -> broadcast::Receiver<LifecycleNotice> {
        self.shared.lifecycle.notices()
    }

    pub fn context(&self) -> &TopicContext {
        &self.shared.context
    }

    /// Rendered control base used to localize inbound topics
    pub fn base_topic(&self) -> &str {
        &self.shared.base_topic
    }

    /// Broker URL with credentials stripped
    pub fn broker(&self) -> &BrokerUrl {
        &self.shared.broker
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.registry.len()
    }

    fn start_session(&self, runtime: Handle) {
        let event_loop = lock_unpoisoned(&self.shared.pending_event_loop)
            .take()
            .unwrap_or_else(|| self.shared.create_connection());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = lifecycle_span!(
            phase = "event_loop",
            client_id = %self.shared.gateway.client_id(),
            broker = %self.shared.broker
        );
        let handle = runtime.spawn(
            run_event_loop(self.shared.clone(), event_loop, shutdown_rx).instrument(span),
        );

        let previous = lock_unpoisoned(&self.shared.session).replace(Session {
            handle,
            shutdown_tx,
        });
        if let Some(previous) = previous {
            let _ = previous.shutdown_tx.send(true);
        }

        // close() may have run while the task was being spawned
        if self.shared.lifecycle.state() == ConnectionState::Closed {
            self.shared.abort_session();
        }
    }
}

impl Shared {
    /// Fresh client and event loop; the shared client is swapped so later
    /// requests go to the new session
    fn create_connection(&self) -> EventLoop {
        self.registry.reset_requests();
        let (client, event_loop) =
            AsyncClient::new(self.options.clone(), self.mqtt.request_capacity.max(1));
        *write_unpoisoned(&self.client) = client;
        event_loop
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        match self.lifecycle.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(TransportError::Closed),
            state => Err(TransportError::NotConnected { state }),
        }
    }

    fn try_subscribe(&self, topic: &Topic, consumer: Consumer) -> Result<String, TransportError> {
        let filter = topic.render(&self.context)?;
        self.ensure_connected()?;

        let replaced = self.registry.register(filter.clone(), consumer);
        let requested = self.registry.track_request(vec![filter.clone()], || {
            read_unpoisoned(&self.client).try_subscribe(filter.clone(), QoS::AtMostOnce)
        });
        if let Err(e) = requested {
            match replaced {
                Some(previous) => {
                    self.registry.register(filter, previous);
                }
                None => {
                    self.registry.remove(&filter);
                }
            }
            return Err(e.into());
        }
        Ok(filter)
    }

    fn try_unsubscribe(&self, topic: &Topic) -> Result<String, TransportError> {
        let filter = topic.render(&self.context)?;
        if self.lifecycle.state() == ConnectionState::Closed {
            return Err(TransportError::Closed);
        }

        self.registry.remove(&filter);
        self.ensure_connected()?;
        read_unpoisoned(&self.client).try_unsubscribe(filter.clone())?;
        Ok(filter)
    }

    fn try_publish(&self, topic: &Topic, payload: &[u8]) -> Result<String, TransportError> {
        let wire_topic = topic.render(&self.context)?;
        self.ensure_connected()?;
        read_unpoisoned(&self.client).try_publish(
            wire_topic.clone(),
            QoS::AtMostOnce,
            false,
            payload.to_vec(),
        )?;
        Ok(wire_topic)
    }

    /// Re-issue every registered filter in one SUBSCRIBE
    fn resubscribe(&self) {
        let filters = self.registry.filters();
        if filters.is_empty() {
            return;
        }

        let count = filters.len();
        let request: Vec<SubscribeFilter> = filters
            .iter()
            .map(|filter| SubscribeFilter::new(filter.clone(), QoS::AtMostOnce))
            .collect();
        let requested = self.registry.track_request(filters, || {
            read_unpoisoned(&self.client).try_subscribe_many(request)
        });
        match requested {
            Ok(()) => info!(count, "Re-subscribed after reconnection"),
            Err(e) => warn!("Failed to re-subscribe after reconnection: {}", e),
        }
    }

    /// Signal the event-loop task to stop without waiting for it
    fn stop_session(&self) {
        if let Some(session) = lock_unpoisoned(&self.session).take() {
            let _ = session.shutdown_tx.send(true);
        }
    }

    fn abort_session(&self) {
        if let Some(session) = lock_unpoisoned(&self.session).take() {
            let _ = session.shutdown_tx.send(true);
            session.handle.abort();
        }
    }

    /// Drop every resource held for the session; reports a panicked task
    fn release(&self) -> Result<(), TransportError> {
        let session = lock_unpoisoned(&self.session).take();
        self.registry.clear();
        lock_unpoisoned(&self.pending_event_loop).take();

        let Some(Session {
            handle,
            shutdown_tx,
        }) = session
        else {
            return Ok(());
        };

        let _ = shutdown_tx.send(true);
        if !handle.is_finished() {
            handle.abort();
            return Ok(());
        }

        match handle.now_or_never() {
            Some(Err(e)) if e.is_panic() => Err(TransportError::EventLoopPanicked(e.to_string())),
            _ => Ok(()),
        }
    }

    /// Process routed MQTT event.
    /// Returns true to continue loop, false to break
    fn process_event_route(&self, route: EventRoute, reconnect_attempts: &mut u32) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                let reconnected = matches!(self.lifecycle.state(), ConnectionState::Reconnecting(_));
                if reconnected && self.mqtt.resubscribe_on_reconnect {
                    self.resubscribe();
                }

                let (_, next) = self.lifecycle.apply(ConnectionEvent::ConnAckReceived);
                *reconnect_attempts = 0;
                next.is_connected()
            }
            EventRoute::MessageReceived { topic, payload } => {
                debug!(target: "mqtt_transport", "Received MQTT message on topic: {}", topic);
                self.registry.dispatch(&self.base_topic, &topic, payload);
                true
            }
            EventRoute::Disconnected => {
                warn!("Broker sent DISCONNECT");
                true
            }
            EventRoute::DisconnectSent => {
                let (previous, next) = self.lifecycle.apply(ConnectionEvent::DisconnectCompleted);
                previous != ConnectionState::Disconnecting && next != ConnectionState::Closed
            }
            EventRoute::SubscribeSent(packet_id) => {
                self.registry.request_sent(packet_id);
                true
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                rejected,
            } => {
                let removed = self.registry.acknowledge(packet_id, &rejected);
                if rejected.is_empty() {
                    debug!(target: "mqtt_transport", "Subscription confirmed: {}", packet_id);
                } else {
                    warn!(packet_id, filters = ?removed, "Broker rejected subscription");
                }
                true
            }
            EventRoute::InfrastructureEvent(event_str) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Handle event loop error, including a CONNACK refusal.
    /// Returns true to continue loop (after reconnection), false to break
    async fn handle_event_loop_error(
        &self,
        error: ConnectionError,
        reconnect_attempts: &mut u32,
        event_loop: &mut EventLoop,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> bool {
        let reason = error.to_string();
        let (previous, next) = self
            .lifecycle
            .apply(ConnectionEvent::ConnectionLost(reason.clone()));

        match (previous, next) {
            (ConnectionState::Connecting, _) => {
                warn!(broker = %self.broker, "Failed to connect: {}", reason);
                false
            }
            (ConnectionState::Connected, ConnectionState::Reconnecting(_)) => {
                self.schedule_reconnect(reconnect_attempts, event_loop, shutdown_rx)
                    .await
            }
            (ConnectionState::Reconnecting(attempt), ConnectionState::Reconnecting(_)) => {
                debug!(attempt, "Reconnection attempt failed: {}", reason);
                self.schedule_reconnect(reconnect_attempts, event_loop, shutdown_rx)
                    .await
            }
            _ => false,
        }
    }

    async fn schedule_reconnect(
        &self,
        reconnect_attempts: &mut u32,
        event_loop: &mut EventLoop,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> bool {
        let shutdown_requested = *shutdown_rx.borrow();
        let decision = should_attempt_reconnection(
            *reconnect_attempts,
            &self.mqtt.reconnect,
            shutdown_requested,
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                *reconnect_attempts = attempt;
                let (_, next) = self
                    .lifecycle
                    .apply(ConnectionEvent::ReconnectionStarted(attempt));
                if !matches!(next, ConnectionState::Reconnecting(_)) {
                    return false;
                }

                let max_display = self
                    .mqtt
                    .reconnect
                    .max_attempts
                    .map_or("∞".to_string(), |max| max.to_string());
                info!(
                    "Attempting reconnection {}/{} after {}ms delay",
                    attempt, max_display, delay_ms
                );

                if !interruptible_sleep(shutdown_rx.clone(), delay_ms).await {
                    return false;
                }

                // A disconnect() or close() may have landed during the delay
                if !matches!(self.lifecycle.state(), ConnectionState::Reconnecting(_)) {
                    return false;
                }

                *event_loop = self.create_connection();
                true
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!("Max reconnection attempts ({reconnect_attempts}) exceeded");
                self.lifecycle
                    .apply(ConnectionEvent::ReconnectAbandoned(reason));
                false
            }
        }
    }
}

/// Drive one session until it ends, is abandoned or shutdown is signalled
async fn run_event_loop(
    shared: Arc<Shared>,
    mut event_loop: EventLoop,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!("Starting MQTT event loop");
    let mut reconnect_attempts = 0u32;

    loop {
        let polled = tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                let stop = changed.is_err() || *shutdown_rx.borrow();
                if stop {
                    info!("Shutdown signal received, stopping event loop");
                    break;
                }
                continue;
            }
            polled = event_loop.poll() => polled,
        };

        let keep_running = match polled {
            Ok(event) => shared.process_event_route(
                MessageHandler::route_mqtt_event(&event),
                &mut reconnect_attempts,
            ),
            Err(error) => {
                shared
                    .handle_event_loop_error(
                        error,
                        &mut reconnect_attempts,
                        &mut event_loop,
                        &shutdown_rx,
                    )
                    .await
            }
        };

        if !keep_running {
            break;
        }
    }

    info!("MQTT event loop stopped");
}

/// Perform interruptible sleep with shutdown monitoring.
/// Returns true if sleep completed, false if shutdown requested
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => {
            let stop = changed.is_err() || *shutdown_rx.borrow();
            if stop {
                info!("Shutdown signal received during reconnection delay, stopping");
            }
            !stop
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

impl Transport for MqttTransport {
    fn connect(&self) {
        let _span = mqtt_span!(operation = "connect", broker = %self.shared.broker).entered();

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => match self.shared.runtime.clone() {
                Some(runtime) => runtime,
                None => {
                    warn!("Failed to initiate connect: {}", e);
                    return;
                }
            },
        };

        let (previous, next) = self
            .shared
            .lifecycle
            .apply(ConnectionEvent::ConnectRequested);
        if next != ConnectionState::Connecting || previous == next {
            debug!(state = ?previous, "Connect ignored");
            return;
        }

        self.start_session(runtime);
    }

    fn disconnect(&self) {
        let _span = mqtt_span!(operation = "disconnect").entered();

        let (previous, next) = self
            .shared
            .lifecycle
            .apply(ConnectionEvent::DisconnectRequested);

        match (previous, next) {
            (ConnectionState::Connected, ConnectionState::Disconnecting) => {
                if let Err(e) = read_unpoisoned(&self.shared.client).try_disconnect() {
                    warn!("Failed to disconnect: {}", e);
                    self.shared
                        .lifecycle
                        .apply(ConnectionEvent::DisconnectFailed(e.to_string()));
                }
            }
            (ConnectionState::Connecting | ConnectionState::Reconnecting(_), _) => {
                info!("Connection attempt cancelled");
                self.shared.stop_session();
            }
            (state, _) => debug!(state = ?state, "Disconnect ignored"),
        }
    }

    fn close(&self) -> Result<(), TransportError> {
        let _span = mqtt_span!(operation = "close").entered();

        let (previous, _) = self.shared.lifecycle.apply(ConnectionEvent::Closed);
        if previous == ConnectionState::Closed {
            debug!("Transport already closed");
            return Ok(());
        }

        if previous != ConnectionState::Disconnected {
            if let Err(e) = read_unpoisoned(&self.shared.client).try_disconnect() {
                debug!("Forcible disconnect failed: {}", e);
            }
        }

        let released = self.shared.release();
        info!("MQTT transport closed");
        released
    }

    fn subscribe(&self, topic: &Topic, consumer: Consumer) {
        let _span = mqtt_span!(operation = "subscribe", topic = %topic).entered();

        match self.shared.try_subscribe(topic, consumer) {
            Ok(filter) => debug!(target: "mqtt_transport", "Subscribe requested: {}", filter),
            Err(e) if e.is_not_connected() => debug!("Failed to subscribe to {}: {}", topic, e),
            Err(e) => warn!("Failed to subscribe to {}: {}", topic, e),
        }
    }

    fn unsubscribe(&self, topic: &Topic) {
        let _span = mqtt_span!(operation = "unsubscribe", topic = %topic).entered();

        match self.shared.try_unsubscribe(topic) {
            Ok(filter) => debug!(target: "mqtt_transport", "Unsubscribe requested: {}", filter),
            Err(e) if e.is_not_connected() => debug!("Failed to unsubscribe from {}: {}", topic, e),
            Err(e) => warn!("Failed to unsubscribe from {}: {}", topic, e),
        }
    }

    fn send_message(&self, topic: &Topic, payload: &[u8]) {
        match self.shared.try_publish(topic, payload) {
            Ok(wire_topic) => {
                debug!(target: "mqtt_transport", bytes = payload.len(), "Published to {}", wire_topic)
            }
            Err(e) => warn!("Failed to send message to {}: {}", topic, e),
        }
    }

    fn when_connected(&self, hook: Hook) {
        self.shared.lifecycle.set_on_connected(hook);
    }

    fn when_disconnected(&self, hook: Hook) {
        self.shared.lifecycle.set_on_disconnected(hook);
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.shared.abort_session();
    }
}
