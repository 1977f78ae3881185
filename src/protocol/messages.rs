//! Message delivered to subscribers

use bytes::Bytes;

/// Inbound message after topic localisation
///
/// Produced by the transport when a publish arrives on a subscribed wire
/// topic; `topic` is relative to the device's control namespace when the
/// wire topic lies inside it, and the raw wire topic otherwise.
///
/// # Examples
/// ```
/// use gateway_sim::protocol::Message;
///
/// let message = Message::new("cmd/restart", b"now".to_vec());
/// assert_eq!(message.topic(), "cmd/restart");
/// assert_eq!(message.payload(), b"now");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    payload: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Cheap clone of the payload buffer
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    pub fn into_parts(self) -> (String, Bytes) {
        (self.topic, self.payload)
    }
}
