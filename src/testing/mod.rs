//! Testing utilities and mock implementations
//!
//! This module provides an in-memory transport for testing simulated device
//! logic without an MQTT broker.

pub mod mocks;

pub use mocks::*;
