//! Messages exchanged between endpoints.

use bytes::Bytes;
use prometheus_client::encoding::EncodeLabelValue;
use std::{collections::HashMap, fmt, time::SystemTime};
use uuid::Uuid;

/// Purpose of a [Message].
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Kind {
    Data,
    Command,
    Ack,
    Error,
}

/// A single logical communication between two endpoints.
///
/// Routing fields are fixed at construction. The payload and headers may still be amended
/// before the message is handed to a [crate::network::Network].
#[derive(Clone, Debug)]
pub struct Message {
    id: Uuid,
    source: String,
    destination: String,
    payload: Bytes,
    kind: Kind,
    timestamp: SystemTime,
    headers: HashMap<String, String>,
}

impl Message {
    /// Create a new message stamped with the current wall-clock time.
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        payload: impl Into<Bytes>,
        kind: Kind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            destination: destination.into(),
            payload: payload.into(),
            kind,
            timestamp: SystemTime::now(),
            headers: HashMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Replace the payload.
    pub fn set_payload(&mut self, payload: impl Into<Bytes>) {
        self.payload = payload.into();
    }

    /// Set a header, overwriting any previous value under `key`.
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn has_header(&self, key: &str) -> bool {
        self.headers.contains_key(key)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message[id: {}, from: {}, to: {}, kind: {:?}, payload: {} bytes]",
            self.id,
            self.source,
            self.destination,
            self.kind,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message() {
        let before = SystemTime::now();
        let msg = Message::new("sensor_1", "gateway", "21.5", Kind::Data);
        assert_eq!(msg.source(), "sensor_1");
        assert_eq!(msg.destination(), "gateway");
        assert_eq!(msg.payload(), &Bytes::from_static(b"21.5"));
        assert_eq!(msg.kind(), Kind::Data);
        assert!(msg.timestamp() >= before);
        assert!(msg.headers().is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Message::new("a", "b", "", Kind::Ack);
        let b = Message::new("a", "b", "", Kind::Ack);
        assert_ne!(a.id(), b.id());

        // Clones describe the same communication
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_amend_before_submission() {
        let mut msg = Message::new("controller", "valve_2", "open", Kind::Command);
        assert!(!msg.has_header("retries"));
        assert_eq!(msg.header("retries"), None);

        msg.add_header("retries", "1");
        msg.add_header("retries", "2");
        msg.set_payload(vec![0u8, 1, 2]);

        assert!(msg.has_header("retries"));
        assert_eq!(msg.header("retries"), Some("2"));
        assert_eq!(msg.headers().len(), 1);
        assert_eq!(msg.payload().as_ref(), &[0u8, 1, 2]);
    }

    #[test]
    fn test_display() {
        let msg = Message::new("a", "b", "hello", Kind::Error);
        let rendered = msg.to_string();
        assert!(rendered.contains("from: a"));
        assert!(rendered.contains("to: b"));
        assert!(rendered.contains("kind: Error"));
        assert!(rendered.contains("payload: 5 bytes"));
    }
}
