//! Device-facing protocol types
//!
//! Topic templating for the per-device wire namespace and the message unit
//! handed to subscribers.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
