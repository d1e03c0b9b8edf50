//! Reference [Directory] backed by in-memory channels.
//!
//! Each registered endpoint receives messages on an unbounded [mpsc] channel. Dropping the
//! receiver closes the endpoint: later deliveries to it fail with [Error::EndpointClosed].

use crate::{message::Message, Directory, Error};
use futures::channel::mpsc;
use std::{collections::BTreeMap, sync::Mutex};
use tracing::{debug, warn};

/// Messages delivered to a registered endpoint.
pub type Receiver = mpsc::UnboundedReceiver<Message>;

/// Synchronized table of endpoints.
#[derive(Default)]
pub struct Endpoints {
    endpoints: Mutex<BTreeMap<String, mpsc::UnboundedSender<Message>>>,
}

impl Endpoints {
    /// Register a new endpoint and return the receiving end of its inbox.
    pub fn register(&self, id: impl Into<String>) -> Result<Receiver, Error> {
        let id = id.into();
        let mut endpoints = self.endpoints.lock().unwrap();
        if endpoints.contains_key(&id) {
            return Err(Error::AlreadyRegistered(id));
        }
        let (sender, receiver) = mpsc::unbounded();
        debug!(endpoint = %id, "registered endpoint");
        endpoints.insert(id, sender);
        Ok(receiver)
    }

    /// Remove an endpoint, returning whether it was registered.
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.endpoints.lock().unwrap().remove(id).is_some();
        if removed {
            debug!(endpoint = %id, "unregistered endpoint");
        }
        removed
    }

    /// Identifiers of all registered endpoints, in order.
    pub fn ids(&self) -> Vec<String> {
        self.endpoints.lock().unwrap().keys().cloned().collect()
    }
}

impl Directory for Endpoints {
    type Handle = (String, mpsc::UnboundedSender<Message>);

    fn lookup(&self, id: &str) -> Option<Self::Handle> {
        self.endpoints
            .lock()
            .unwrap()
            .get(id)
            .map(|sender| (id.to_string(), sender.clone()))
    }

    fn exists(&self, id: &str) -> bool {
        self.endpoints.lock().unwrap().contains_key(id)
    }

    fn deliver(&self, handle: &Self::Handle, message: Message) -> Result<(), Error> {
        let (id, sender) = handle;
        sender
            .unbounded_send(message)
            .map_err(|_| Error::EndpointClosed(id.clone()))
    }

    fn count(&self) -> usize {
        self.endpoints.lock().unwrap().len()
    }

    fn broadcast_except(&self, source: &str, message: &Message) -> usize {
        let endpoints = self.endpoints.lock().unwrap();
        let mut delivered = 0;
        for (id, sender) in endpoints.iter() {
            if id == source {
                continue;
            }
            if sender.unbounded_send(message.clone()).is_err() {
                warn!(endpoint = %id, "dropping broadcast to closed endpoint");
                continue;
            }
            delivered += 1;
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Kind;

    #[test]
    fn test_register_duplicate() {
        let endpoints = Endpoints::default();
        let _receiver = endpoints.register("sensor_1").unwrap();
        let result = endpoints.register("sensor_1");
        assert!(matches!(result, Err(Error::AlreadyRegistered(id)) if id == "sensor_1"));
        assert_eq!(endpoints.count(), 1);
    }

    #[test]
    fn test_lookup_and_deliver() {
        let endpoints = Endpoints::default();
        let mut receiver = endpoints.register("gateway").unwrap();
        assert!(endpoints.exists("gateway"));
        assert!(!endpoints.exists("unknown"));
        assert!(endpoints.lookup("unknown").is_none());

        let handle = endpoints.lookup("gateway").unwrap();
        let msg = Message::new("sensor_1", "gateway", "21.5", Kind::Data);
        let id = msg.id();
        endpoints.deliver(&handle, msg).unwrap();

        let received = receiver.try_next().unwrap().unwrap();
        assert_eq!(received.id(), id);
    }

    #[test]
    fn test_deliver_to_closed_endpoint() {
        let endpoints = Endpoints::default();
        let receiver = endpoints.register("gateway").unwrap();
        let handle = endpoints.lookup("gateway").unwrap();
        drop(receiver);

        let msg = Message::new("sensor_1", "gateway", "21.5", Kind::Data);
        let result = endpoints.deliver(&handle, msg);
        assert!(matches!(result, Err(Error::EndpointClosed(id)) if id == "gateway"));
    }

    #[test]
    fn test_broadcast_skips_source() {
        let endpoints = Endpoints::default();
        let mut source = endpoints.register("controller").unwrap();
        let mut a = endpoints.register("valve_1").unwrap();
        let mut b = endpoints.register("valve_2").unwrap();
        let closed = endpoints.register("valve_3").unwrap();
        drop(closed);

        let msg = Message::new("controller", "*", "close", Kind::Command);
        assert_eq!(endpoints.broadcast_except("controller", &msg), 2);

        assert_eq!(a.try_next().unwrap().unwrap().id(), msg.id());
        assert_eq!(b.try_next().unwrap().unwrap().id(), msg.id());
        assert!(source.try_next().is_err());
    }

    #[test]
    fn test_unregister() {
        let endpoints = Endpoints::default();
        let _a = endpoints.register("b").unwrap();
        let _b = endpoints.register("a").unwrap();
        assert_eq!(endpoints.ids(), vec!["a".to_string(), "b".to_string()]);

        assert!(endpoints.unregister("a"));
        assert!(!endpoints.unregister("a"));
        assert_eq!(endpoints.ids(), vec!["b".to_string()]);
        assert_eq!(endpoints.count(), 1);
    }
}
