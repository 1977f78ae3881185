//! Gateway Simulator - MQTT transport
//!
//! The transport layer of an IoT gateway simulator: one simulated device
//! holds one MQTT session namespaced by its account name and client id.
//!
//! # Overview
//!
//! - Topic templates rendered against the device identity, and the inverse
//!   localization of inbound wire topics
//! - Broker URLs with embedded credentials, stripped before use
//! - A connection lifecycle with hooks, observers and automatic reconnection
//! - Subscribe, unsubscribe and fire-and-forget publish on rendered topics
//!
//! # Quick Start
//!
//! ```rust
//! use gateway_sim::config::GatewayConfiguration;
//! use gateway_sim::protocol::{localize, Topic, TopicContext};
//!
//! let gateway = GatewayConfiguration::new("acct1", "dev1", "mqtt://localhost:1883");
//! let context = TopicContext::from_configuration(&gateway);
//!
//! let topic = Topic::control("cmd/restart").unwrap();
//! let wire = topic.render(&context).unwrap();
//! assert_eq!(wire, "$EDC/acct1/dev1/cmd/restart");
//!
//! let base = Topic::control_base().render(&context).unwrap();
//! assert_eq!(localize(&base, &wire), "cmd/restart");
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use config::*;
pub use error::{SimulatorError, SimulatorResult};
pub use protocol::*;
pub use transport::mqtt::{ConnectionState, LifecycleNotice, MqttTransport, TransportError};
pub use transport::{Consumer, Hook, Transport};
