//! Connection lifecycle state machine
//!
//! [`determine_next_state`] is the pure transition table. [`Lifecycle`] owns
//! the current state, applies events atomically and notifies observers: the
//! single connected/disconnected hooks (last registration wins) and any
//! number of [`LifecycleNotice`] receivers.
//!
//! Notices are emitted from whichever task applies the event, normally the
//! client's event-loop task. A loss of the session is announced once; the
//! automatic reconnect attempts that follow stay silent until a new ConnAck.

use super::connection::{ConnectionState, ReconnectConfig};
use super::{call_guarded, lock_unpoisoned};
use crate::transport::Hook;
use std::sync::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

const NOTICE_CAPACITY: usize = 16;

/// Inputs to the lifecycle state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Caller asked for a connection
    ConnectRequested,
    /// Broker accepted the session
    ConnAckReceived,
    /// Initial connection attempt failed
    ConnectFailed(String),
    /// Established session dropped without a caller request
    ConnectionLost(String),
    /// Automatic reconnect attempt started
    ReconnectionStarted(u32),
    /// Automatic reconnect gave up
    ReconnectAbandoned(String),
    /// Caller asked for a disconnect
    DisconnectRequested,
    /// DISCONNECT went out
    DisconnectCompleted,
    /// DISCONNECT could not be issued
    DisconnectFailed(String),
    /// Transport torn down
    Closed,
}

/// Why the session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    ConnectionLost(String),
}

/// Observer notification emitted on lifecycle transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleNotice {
    Connected { reconnected: bool },
    Disconnected(DisconnectReason),
}

/// Result of applying one event to one state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: ConnectionState,
    pub notice: Option<LifecycleNotice>,
}

impl Transition {
    fn to(next: ConnectionState) -> Self {
        Self { next, notice: None }
    }

    fn notify(next: ConnectionState, notice: LifecycleNotice) -> Self {
        Self {
            next,
            notice: Some(notice),
        }
    }
}

/// Transition table (pure function)
pub fn determine_next_state(current: &ConnectionState, event: &ConnectionEvent) -> Transition {
    use ConnectionEvent as E;
    use ConnectionState as S;

    match (current, event) {
        (S::Closed, _) => Transition::to(S::Closed),
        (_, E::Closed) => Transition::to(S::Closed),

        (S::Disconnected, E::ConnectRequested) => Transition::to(S::Connecting),
        (S::Connecting, E::ConnAckReceived) => Transition::notify(
            S::Connected,
            LifecycleNotice::Connected { reconnected: false },
        ),
        (S::Reconnecting(_), E::ConnAckReceived) => Transition::notify(
            S::Connected,
            LifecycleNotice::Connected { reconnected: true },
        ),
        (S::Connecting, E::ConnectFailed(_) | E::ConnectionLost(_)) => {
            Transition::to(S::Disconnected)
        }

        (S::Connected, E::ConnectionLost(reason)) => Transition::notify(
            S::Reconnecting(0),
            LifecycleNotice::Disconnected(DisconnectReason::ConnectionLost(reason.clone())),
        ),
        (S::Reconnecting(_), E::ReconnectionStarted(attempt)) => {
            Transition::to(S::Reconnecting(*attempt))
        }
        (S::Reconnecting(_), E::ReconnectAbandoned(_)) => Transition::to(S::Disconnected),

        (S::Connected, E::DisconnectRequested) => Transition::to(S::Disconnecting),
        (S::Connecting | S::Reconnecting(_), E::DisconnectRequested) => {
            Transition::to(S::Disconnected)
        }
        (S::Disconnecting, E::DisconnectCompleted | E::ConnectionLost(_)) => Transition::notify(
            S::Disconnected,
            LifecycleNotice::Disconnected(DisconnectReason::Requested),
        ),
        (S::Disconnecting, E::DisconnectFailed(_)) => Transition::to(S::Connected),

        (state, _) => Transition::to(state.clone()),
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq, Eq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Determine if reconnection should be attempted (pure function)
pub fn should_attempt_reconnection(
    current_attempts: u32,
    config: &ReconnectConfig,
    shutdown_requested: bool,
) -> ReconnectionDecision {
    if shutdown_requested {
        return ReconnectionDecision::AbortShutdownRequested;
    }

    if let Some(max_attempts) = config.max_attempts {
        if current_attempts >= max_attempts {
            return ReconnectionDecision::AbortMaxAttemptsExceeded;
        }
    }

    let attempt = current_attempts + 1;
    ReconnectionDecision::Proceed {
        attempt,
        delay_ms: config.calculate_backoff_delay(attempt),
    }
}

/// Log connection state transition
pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
    match (from, to) {
        (ConnectionState::Connecting, ConnectionState::Connected) => {
            info!("MQTT connection established");
        }
        (ConnectionState::Connected, ConnectionState::Reconnecting(_)) => {
            warn!("MQTT connection lost");
        }
        (ConnectionState::Reconnecting(_), ConnectionState::Connected) => {
            info!("Reconnection successful");
        }
        (ConnectionState::Reconnecting(_), ConnectionState::Disconnected) => {
            error!("Reconnection abandoned");
        }
        _ => {
            info!("MQTT connection state: {:?} -> {:?}", from, to);
        }
    }
}

/// Current connection state plus observers
pub struct Lifecycle {
    state_tx: watch::Sender<ConnectionState>,
    notices: broadcast::Sender<LifecycleNotice>,
    on_connected: Mutex<Option<Hook>>,
    on_disconnected: Mutex<Option<Hook>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            state_tx,
            notices,
            on_connected: Mutex::new(None),
            on_disconnected: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<LifecycleNotice> {
        self.notices.subscribe()
    }

    /// Replace the connected hook
    pub fn set_on_connected(&self, hook: Hook) {
        *lock_unpoisoned(&self.on_connected) = Some(hook);
    }

    /// Replace the disconnected hook
    pub fn set_on_disconnected(&self, hook: Hook) {
        *lock_unpoisoned(&self.on_disconnected) = Some(hook);
    }

    /// Apply `event` atomically; returns the previous and the new state.
    ///
    /// Hooks run after the state update, outside any lock, so they may call
    /// back into the transport.
    pub fn apply(&self, event: ConnectionEvent) -> (ConnectionState, ConnectionState) {
        let mut previous = ConnectionState::Disconnected;
        let mut transition = Transition::to(ConnectionState::Disconnected);

        self.state_tx.send_if_modified(|state| {
            transition = determine_next_state(state, &event);
            previous = std::mem::replace(state, transition.next.clone());
            previous != *state
        });

        if previous != transition.next {
            log_state_transition(&previous, &transition.next);
        }
        if let Some(notice) = transition.notice {
            self.notify(notice);
        }

        (previous, transition.next)
    }

    fn notify(&self, notice: LifecycleNotice) {
        let hook = match notice {
            LifecycleNotice::Connected { .. } => lock_unpoisoned(&self.on_connected).clone(),
            LifecycleNotice::Disconnected(_) => lock_unpoisoned(&self.on_disconnected).clone(),
        };

        // No receivers is fine
        let _ = self.notices.send(notice);

        if let Some(hook) = hook {
            call_guarded("lifecycle hook", || hook());
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_hook(counter: &Arc<AtomicUsize>) -> Hook {
        let counter = counter.clone();
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_initial_connect_transitions() {
        let connecting =
            determine_next_state(&ConnectionState::Disconnected, &ConnectionEvent::ConnectRequested);
        assert_eq!(connecting, Transition::to(ConnectionState::Connecting));

        let connected =
            determine_next_state(&ConnectionState::Connecting, &ConnectionEvent::ConnAckReceived);
        assert_eq!(connected.next, ConnectionState::Connected);
        assert_eq!(
            connected.notice,
            Some(LifecycleNotice::Connected { reconnected: false })
        );
    }

    #[test]
    fn test_initial_connect_failure_has_no_notice() {
        let failed = determine_next_state(
            &ConnectionState::Connecting,
            &ConnectionEvent::ConnectFailed("refused".to_string()),
        );
        assert_eq!(failed, Transition::to(ConnectionState::Disconnected));
    }

    #[test]
    fn test_connection_loss_notifies_once() {
        let lost = determine_next_state(
            &ConnectionState::Connected,
            &ConnectionEvent::ConnectionLost("reset".to_string()),
        );
        assert_eq!(lost.next, ConnectionState::Reconnecting(0));
        assert_eq!(
            lost.notice,
            Some(LifecycleNotice::Disconnected(
                DisconnectReason::ConnectionLost("reset".to_string())
            ))
        );

        let lost_again = determine_next_state(
            &ConnectionState::Reconnecting(3),
            &ConnectionEvent::ConnectionLost("reset".to_string()),
        );
        assert_eq!(lost_again, Transition::to(ConnectionState::Reconnecting(3)));
    }

    #[test]
    fn test_reconnect_transitions() {
        let started = determine_next_state(
            &ConnectionState::Reconnecting(0),
            &ConnectionEvent::ReconnectionStarted(1),
        );
        assert_eq!(started, Transition::to(ConnectionState::Reconnecting(1)));

        let restored =
            determine_next_state(&ConnectionState::Reconnecting(1), &ConnectionEvent::ConnAckReceived);
        assert_eq!(
            restored.notice,
            Some(LifecycleNotice::Connected { reconnected: true })
        );

        let abandoned = determine_next_state(
            &ConnectionState::Reconnecting(5),
            &ConnectionEvent::ReconnectAbandoned("max".to_string()),
        );
        assert_eq!(abandoned, Transition::to(ConnectionState::Disconnected));
    }

    #[test]
    fn test_requested_disconnect_transitions() {
        let disconnecting =
            determine_next_state(&ConnectionState::Connected, &ConnectionEvent::DisconnectRequested);
        assert_eq!(disconnecting, Transition::to(ConnectionState::Disconnecting));

        let completed = determine_next_state(
            &ConnectionState::Disconnecting,
            &ConnectionEvent::DisconnectCompleted,
        );
        assert_eq!(completed.next, ConnectionState::Disconnected);
        assert_eq!(
            completed.notice,
            Some(LifecycleNotice::Disconnected(DisconnectReason::Requested))
        );

        let failed = determine_next_state(
            &ConnectionState::Disconnecting,
            &ConnectionEvent::DisconnectFailed("queue full".to_string()),
        );
        assert_eq!(failed, Transition::to(ConnectionState::Connected));

        // Nothing established yet: no notice
        let aborted =
            determine_next_state(&ConnectionState::Connecting, &ConnectionEvent::DisconnectRequested);
        assert_eq!(aborted, Transition::to(ConnectionState::Disconnected));
    }

    #[test]
    fn test_closed_is_terminal() {
        for event in [
            ConnectionEvent::ConnectRequested,
            ConnectionEvent::ConnAckReceived,
            ConnectionEvent::ConnectionLost("x".to_string()),
        ] {
            assert_eq!(
                determine_next_state(&ConnectionState::Closed, &event),
                Transition::to(ConnectionState::Closed)
            );
        }
        assert_eq!(
            determine_next_state(&ConnectionState::Connected, &ConnectionEvent::Closed),
            Transition::to(ConnectionState::Closed)
        );
    }

    #[test]
    fn test_irrelevant_events_keep_state() {
        assert_eq!(
            determine_next_state(&ConnectionState::Connected, &ConnectionEvent::ConnectRequested),
            Transition::to(ConnectionState::Connected)
        );
        assert_eq!(
            determine_next_state(
                &ConnectionState::Disconnected,
                &ConnectionEvent::ConnectionLost("x".to_string())
            ),
            Transition::to(ConnectionState::Disconnected)
        );
    }

    #[test]
    fn test_should_attempt_reconnection() {
        let config = ReconnectConfig {
            max_attempts: Some(2),
            backoff_pattern: vec![10, 20],
            sustained_delay: 30,
        };

        assert_eq!(
            should_attempt_reconnection(0, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 10
            }
        );
        assert_eq!(
            should_attempt_reconnection(1, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 2,
                delay_ms: 20
            }
        );
        assert_eq!(
            should_attempt_reconnection(2, &config, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
        assert_eq!(
            should_attempt_reconnection(0, &config, true),
            ReconnectionDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_unlimited_reconnection() {
        let config = ReconnectConfig::default();
        assert!(matches!(
            should_attempt_reconnection(10_000, &config, false),
            ReconnectionDecision::Proceed { delay_ms: 128_000, .. }
        ));
    }

    #[test]
    fn test_lifecycle_hooks_fire_exactly_once() {
        let lifecycle = Lifecycle::new();
        let connected = Arc::new(AtomicUsize::new(0));
        let disconnected = Arc::new(AtomicUsize::new(0));
        lifecycle.set_on_connected(counting_hook(&connected));
        lifecycle.set_on_disconnected(counting_hook(&disconnected));

        lifecycle.apply(ConnectionEvent::ConnectRequested);
        lifecycle.apply(ConnectionEvent::ConnAckReceived);
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert_eq!(disconnected.load(Ordering::SeqCst), 0);

        lifecycle.apply(ConnectionEvent::ConnectionLost("socket closed".to_string()));
        lifecycle.apply(ConnectionEvent::ConnectionLost("socket closed".to_string()));
        lifecycle.apply(ConnectionEvent::ReconnectionStarted(1));
        lifecycle.apply(ConnectionEvent::ConnectionLost("refused".to_string()));
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.state(), ConnectionState::Reconnecting(1));

        lifecycle.apply(ConnectionEvent::ConnAckReceived);
        assert_eq!(connected.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_last_hook_registration_wins() {
        let lifecycle = Lifecycle::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        lifecycle.set_on_connected(counting_hook(&first));
        lifecycle.set_on_connected(counting_hook(&second));

        lifecycle.apply(ConnectionEvent::ConnectRequested);
        lifecycle.apply(ConnectionEvent::ConnAckReceived);

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_hook_is_contained() {
        let lifecycle = Lifecycle::new();
        lifecycle.set_on_connected(Arc::new(|| panic!("hook failure")));

        lifecycle.apply(ConnectionEvent::ConnectRequested);
        let (_, state) = lifecycle.apply(ConnectionEvent::ConnAckReceived);
        assert_eq!(state, ConnectionState::Connected);
    }

    #[test]
    fn test_apply_reports_previous_state() {
        let lifecycle = Lifecycle::new();
        assert_eq!(
            lifecycle.apply(ConnectionEvent::ConnectRequested),
            (ConnectionState::Disconnected, ConnectionState::Connecting)
        );
        assert_eq!(
            lifecycle.apply(ConnectionEvent::ConnectRequested),
            (ConnectionState::Connecting, ConnectionState::Connecting)
        );
    }

    #[tokio::test]
    async fn test_notices_reach_every_observer() {
        let lifecycle = Lifecycle::new();
        let mut first = lifecycle.notices();
        let mut second = lifecycle.notices();

        lifecycle.apply(ConnectionEvent::ConnectRequested);
        lifecycle.apply(ConnectionEvent::ConnAckReceived);
        lifecycle.apply(ConnectionEvent::DisconnectRequested);
        lifecycle.apply(ConnectionEvent::DisconnectCompleted);

        for receiver in [&mut first, &mut second] {
            assert_eq!(
                receiver.recv().await.unwrap(),
                LifecycleNotice::Connected { reconnected: false }
            );
            assert_eq!(
                receiver.recv().await.unwrap(),
                LifecycleNotice::Disconnected(DisconnectReason::Requested)
            );
        }
    }

    #[tokio::test]
    async fn test_watch_state_sees_changes() {
        let lifecycle = Lifecycle::new();
        let mut state_rx = lifecycle.watch_state();
        assert_eq!(*state_rx.borrow(), ConnectionState::Disconnected);

        lifecycle.apply(ConnectionEvent::ConnectRequested);
        state_rx.changed().await.unwrap();
        assert_eq!(*state_rx.borrow(), ConnectionState::Connecting);
    }
}
