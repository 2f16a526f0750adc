use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope for control traffic between the scheduler and its workers.
///
/// Payloads are MessagePack-encoded with field names, so tagged message
/// enums (`{op: ..., ...}`) decode the same way they would off a socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Operation name of the payload, e.g. `compute` or `task-finished`.
    pub op: String,

    /// MessagePack-encoded payload bytes.
    pub payload: Vec<u8>,

    /// When this message was created.
    pub timestamp: DateTime<Utc>,

    /// Correlation ID for tracing a message through logs.
    pub correlation_id: Uuid,

    /// Schema version for forward-compatible evolution.
    #[serde(default = "default_version")]
    pub version: u16,
}

fn default_version() -> u16 {
    1
}

impl Message {
    /// Create a new message, serializing the payload with MessagePack.
    pub fn new<T: Serialize>(
        op: impl Into<String>,
        payload: &T,
    ) -> Result<Self, rmp_serde::encode::Error> {
        Ok(Self {
            op: op.into(),
            payload: rmp_serde::to_vec_named(payload)?,
            timestamp: Utc::now(),
            correlation_id: Uuid::new_v4(),
            version: 1,
        })
    }

    /// Deserialize the payload into the expected type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, rmp_serde::decode::Error> {
        rmp_serde::from_slice(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_message() {
        let msg = Message::new("test-op", &"hello world".to_string()).unwrap();
        assert_eq!(msg.op, "test-op");
        assert_eq!(msg.decode::<String>().unwrap(), "hello world");
        assert_eq!(msg.version, 1);
    }

    #[test]
    fn correlation_ids_are_unique() {
        let a = Message::new("x", &1u8).unwrap();
        let b = Message::new("x", &1u8).unwrap();
        assert_ne!(a.correlation_id, b.correlation_id);
    }
}
