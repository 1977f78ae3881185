//! Pure event routing and inbound message dispatch
//!
//! [`MessageHandler::route_mqtt_event`] turns rumqttc events into routing
//! decisions; [`SubscriptionRegistry`] keeps the consumers registered per wire
//! filter and hands each inbound publish to every consumer whose filter
//! matches. It also follows each SUBSCRIBE to its SUBACK so filters the
//! broker refuses are dropped.

use super::{call_guarded, lock_unpoisoned, read_unpoisoned, write_unpoisoned};
use crate::protocol::{localize, matches_filter, Message};
use crate::transport::Consumer;
use bytes::Bytes;
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, SubscribeReasonCode};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, RwLock};
use tracing::debug;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    ///
    /// A refused CONNACK never shows up here: the event loop reports it as
    /// `ConnectionError::ConnectionRefused` from `poll()`.
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) if connack.code == ConnectReturnCode::Success => {
                    EventRoute::ConnectionAcknowledged
                }
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    rejected: suback
                        .return_codes
                        .iter()
                        .enumerate()
                        .filter(|(_, code)| matches!(code, SubscribeReasonCode::Failure))
                        .map(|(index, _)| index)
                        .collect(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Subscribe(packet_id)) => EventRoute::SubscribeSent(*packet_id),
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// MQTT broker disconnected
    Disconnected,
    /// Our DISCONNECT was written to the socket
    DisconnectSent,
    /// A queued SUBSCRIBE was written with this packet id
    SubscribeSent(u16),
    /// Subscription confirmed; `rejected` holds the positions of the filters
    /// the broker refused
    SubscriptionConfirmed { packet_id: u16, rejected: Vec<usize> },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// SUBSCRIBE requests waiting for a packet id, then for their SUBACK
#[derive(Default)]
struct PendingRequests {
    queued: VecDeque<Vec<String>>,
    in_flight: HashMap<u16, Vec<String>>,
}

/// Consumers keyed by rendered wire filter
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<BTreeMap<String, Consumer>>,
    requests: Mutex<PendingRequests>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `consumer` for `filter`; returns the consumer it replaced
    pub fn register(&self, filter: impl Into<String>, consumer: Consumer) -> Option<Consumer> {
        write_unpoisoned(&self.entries).insert(filter.into(), consumer)
    }

    pub fn remove(&self, filter: &str) -> Option<Consumer> {
        write_unpoisoned(&self.entries).remove(filter)
    }

    pub fn clear(&self) {
        write_unpoisoned(&self.entries).clear();
        self.reset_requests();
    }

    /// Queue a SUBSCRIBE for `filters` through `send`.
    ///
    /// Requests are tracked in the order they are sent, which is the order
    /// the event loop writes them and reports their packet ids.
    pub fn track_request<E>(
        &self,
        filters: Vec<String>,
        send: impl FnOnce() -> Result<(), E>,
    ) -> Result<(), E> {
        let mut requests = lock_unpoisoned(&self.requests);
        send()?;
        requests.queued.push_back(filters);
        Ok(())
    }

    /// The oldest queued SUBSCRIBE went out as `packet_id`
    pub fn request_sent(&self, packet_id: u16) {
        let mut requests = lock_unpoisoned(&self.requests);
        match requests.queued.pop_front() {
            Some(filters) => {
                requests.in_flight.insert(packet_id, filters);
            }
            None => debug!(packet_id, "SUBSCRIBE sent without a tracked request"),
        }
    }

    /// Settle the SUBACK for `packet_id`, unregistering every filter at a
    /// `rejected` position. Returns the filters removed.
    pub fn acknowledge(&self, packet_id: u16, rejected: &[usize]) -> Vec<String> {
        let Some(filters) = lock_unpoisoned(&self.requests).in_flight.remove(&packet_id) else {
            return Vec::new();
        };

        rejected
            .iter()
            .filter_map(|&index| filters.get(index))
            .filter(|filter| self.remove(filter).is_some())
            .cloned()
            .collect()
    }

    /// Forget requests of a session that ended
    pub fn reset_requests(&self) {
        let mut requests = lock_unpoisoned(&self.requests);
        requests.queued.clear();
        requests.in_flight.clear();
    }

    /// SUBSCRIBE requests not yet acknowledged
    pub fn pending_requests(&self) -> usize {
        let requests = lock_unpoisoned(&self.requests);
        requests.queued.len() + requests.in_flight.len()
    }

    pub fn contains(&self, filter: &str) -> bool {
        read_unpoisoned(&self.entries).contains_key(filter)
    }

    /// Registered wire filters, in sorted order
    pub fn filters(&self) -> Vec<String> {
        read_unpoisoned(&self.entries).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        read_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        read_unpoisoned(&self.entries).is_empty()
    }

    /// Deliver one inbound publish to every consumer whose filter matches.
    ///
    /// The consumers see the topic localized against `base`. Each consumer runs
    /// guarded, outside the registry lock, so it may subscribe or unsubscribe
    /// from within the callback. Returns the number of consumers invoked.
    pub fn dispatch(&self, base: &str, wire_topic: &str, payload: Bytes) -> usize {
        let consumers: Vec<Consumer> = read_unpoisoned(&self.entries)
            .iter()
            .filter(|(filter, _)| matches_filter(filter, wire_topic))
            .map(|(_, consumer)| consumer.clone())
            .collect();

        if consumers.is_empty() {
            debug!(topic = %wire_topic, "No consumer registered for inbound message");
            return 0;
        }

        let local_topic = localize(base, wire_topic);
        for consumer in &consumers {
            let message = Message::new(local_topic, payload.clone());
            call_guarded("message consumer", || consumer(message));
        }
        consumers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, Publish, QoS, SubAck};
    use std::sync::{Arc, Mutex};

    const BASE: &str = "$EDC/acct1/dev1";

    fn recording_consumer(sink: &Arc<Mutex<Vec<Message>>>) -> Consumer {
        let sink = sink.clone();
        Arc::new(move |message| sink.lock().unwrap().push(message))
    }

    #[test]
    fn test_route_connack() {
        let accepted = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&accepted),
            EventRoute::ConnectionAcknowledged
        );

        // Refusals surface as a poll() error, never as a routed ConnAck
        let refused = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::NotAuthorized,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&refused),
            EventRoute::InfrastructureEvent(_)
        ));
    }

    #[test]
    fn test_route_publish() {
        let publish = Publish::new("$EDC/acct1/dev1/cmd", QoS::AtMostOnce, b"on".to_vec());
        let route = MessageHandler::route_mqtt_event(&Event::Incoming(Packet::Publish(publish)));
        assert_eq!(
            route,
            EventRoute::MessageReceived {
                topic: "$EDC/acct1/dev1/cmd".to_string(),
                payload: Bytes::from_static(b"on"),
            }
        );
    }

    #[test]
    fn test_route_disconnects() {
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::Disconnect)),
            EventRoute::Disconnected
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Disconnect)),
            EventRoute::DisconnectSent
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        );
    }

    #[test]
    fn test_route_suback_lists_rejections() {
        let suback = SubAck::new(
            7,
            vec![
                SubscribeReasonCode::Success(QoS::AtMostOnce),
                SubscribeReasonCode::Failure,
            ],
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::SubAck(suback))),
            EventRoute::SubscriptionConfirmed {
                packet_id: 7,
                rejected: vec![1]
            }
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Subscribe(7))),
            EventRoute::SubscribeSent(7)
        );
    }

    #[test]
    fn test_rejected_filters_are_unregistered() {
        let registry = SubscriptionRegistry::new();
        let sink = Arc::new(Mutex::new(Vec::new()));
        registry.register("$EDC/acct1/dev1/a", recording_consumer(&sink));
        registry.register("$EDC/acct1/dev1/b", recording_consumer(&sink));

        registry
            .track_request::<()>(
                vec!["$EDC/acct1/dev1/a".to_string(), "$EDC/acct1/dev1/b".to_string()],
                || Ok(()),
            )
            .unwrap();
        registry.request_sent(3);

        let removed = registry.acknowledge(3, &[1]);

        assert_eq!(removed, vec!["$EDC/acct1/dev1/b".to_string()]);
        assert!(registry.contains("$EDC/acct1/dev1/a"));
        assert!(!registry.contains("$EDC/acct1/dev1/b"));
        assert_eq!(registry.pending_requests(), 0);
    }

    #[test]
    fn test_requests_match_packet_ids_in_order() {
        let registry = SubscriptionRegistry::new();
        let sink = Arc::new(Mutex::new(Vec::new()));
        registry.register("first", recording_consumer(&sink));
        registry.register("second", recording_consumer(&sink));

        registry
            .track_request::<()>(vec!["first".to_string()], || Ok(()))
            .unwrap();
        registry
            .track_request::<()>(vec!["second".to_string()], || Ok(()))
            .unwrap();
        registry.request_sent(10);
        registry.request_sent(11);

        assert_eq!(registry.acknowledge(11, &[0]), vec!["second".to_string()]);
        assert!(registry.contains("first"));
        assert!(registry.acknowledge(10, &[]).is_empty());
        assert_eq!(registry.pending_requests(), 0);
    }

    #[test]
    fn test_failed_send_is_not_tracked() {
        let registry = SubscriptionRegistry::new();
        let sent = registry.track_request(vec!["a".to_string()], || Err("queue full"));
        assert_eq!(sent, Err("queue full"));
        assert_eq!(registry.pending_requests(), 0);

        // Unknown packet ids are ignored
        registry.request_sent(1);
        assert!(registry.acknowledge(1, &[0]).is_empty());
    }

    #[test]
    fn test_reset_requests_forgets_in_flight() {
        let registry = SubscriptionRegistry::new();
        let sink = Arc::new(Mutex::new(Vec::new()));
        registry.register("a", recording_consumer(&sink));
        registry
            .track_request::<()>(vec!["a".to_string()], || Ok(()))
            .unwrap();
        registry.request_sent(5);

        registry.reset_requests();

        assert!(registry.acknowledge(5, &[0]).is_empty());
        assert!(registry.contains("a"));
    }

    #[test]
    fn test_route_infrastructure() {
        assert!(matches!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::PingResp)),
            EventRoute::InfrastructureEvent(_)
        ));
    }

    #[test]
    fn test_dispatch_localizes_topic() {
        let registry = SubscriptionRegistry::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        registry.register("$EDC/acct1/dev1/cmd/restart", recording_consumer(&received));

        let delivered = registry.dispatch(
            BASE,
            "$EDC/acct1/dev1/cmd/restart",
            Bytes::from_static(b"now"),
        );

        assert_eq!(delivered, 1);
        let received = received.lock().unwrap();
        assert_eq!(received[0].topic(), "cmd/restart");
        assert_eq!(received[0].payload(), b"now");
    }

    #[test]
    fn test_dispatch_to_every_matching_filter() {
        let registry = SubscriptionRegistry::new();
        let exact = Arc::new(Mutex::new(Vec::new()));
        let wildcard = Arc::new(Mutex::new(Vec::new()));
        let other = Arc::new(Mutex::new(Vec::new()));
        registry.register("$EDC/acct1/dev1/cmd/restart", recording_consumer(&exact));
        registry.register("$EDC/acct1/dev1/cmd/#", recording_consumer(&wildcard));
        registry.register("$EDC/acct1/dev1/config", recording_consumer(&other));

        let delivered = registry.dispatch(BASE, "$EDC/acct1/dev1/cmd/restart", Bytes::new());

        assert_eq!(delivered, 2);
        assert_eq!(exact.lock().unwrap().len(), 1);
        assert_eq!(wildcard.lock().unwrap().len(), 1);
        assert!(other.lock().unwrap().is_empty());
    }

    #[test]
    fn test_dispatch_foreign_topic_is_unchanged() {
        let registry = SubscriptionRegistry::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        registry.register("acct1/dev1/data", recording_consumer(&received));

        registry.dispatch(BASE, "acct1/dev1/data", Bytes::new());

        assert_eq!(received.lock().unwrap()[0].topic(), "acct1/dev1/data");
    }

    #[test]
    fn test_dispatch_without_match() {
        let registry = SubscriptionRegistry::new();
        assert_eq!(registry.dispatch(BASE, "$EDC/acct1/dev1/x", Bytes::new()), 0);
    }

    #[test]
    fn test_panicking_consumer_does_not_stop_others() {
        let registry = SubscriptionRegistry::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        registry.register("$EDC/acct1/dev1/a", Arc::new(|_| panic!("consumer failure")));
        registry.register("$EDC/acct1/dev1/+", recording_consumer(&received));

        let delivered = registry.dispatch(BASE, "$EDC/acct1/dev1/a", Bytes::new());

        assert_eq!(delivered, 2);
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_register_replaces_and_remove() {
        let registry = SubscriptionRegistry::new();
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));

        assert!(registry
            .register("$EDC/acct1/dev1/a", recording_consumer(&first))
            .is_none());
        assert!(registry
            .register("$EDC/acct1/dev1/a", recording_consumer(&second))
            .is_some());
        assert_eq!(registry.len(), 1);

        registry.dispatch(BASE, "$EDC/acct1/dev1/a", Bytes::new());
        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);

        assert!(registry.remove("$EDC/acct1/dev1/a").is_some());
        assert!(registry.remove("$EDC/acct1/dev1/a").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_consumer_may_modify_registry() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let inner = registry.clone();
        registry.register(
            "$EDC/acct1/dev1/once",
            Arc::new(move |_| {
                inner.remove("$EDC/acct1/dev1/once");
            }),
        );

        registry.dispatch(BASE, "$EDC/acct1/dev1/once", Bytes::new());
        assert!(!registry.contains("$EDC/acct1/dev1/once"));
    }

    #[test]
    fn test_filters_sorted() {
        let registry = SubscriptionRegistry::new();
        let sink = Arc::new(Mutex::new(Vec::new()));
        registry.register("b", recording_consumer(&sink));
        registry.register("a", recording_consumer(&sink));
        assert_eq!(registry.filters(), vec!["a".to_string(), "b".to_string()]);

        registry.clear();
        assert!(registry.filters().is_empty());
    }
}
