use crate::message::Kind;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Message {
    pub kind: Kind,
}

impl Message {
    pub fn new(kind: Kind) -> Self {
        Self { kind }
    }
}

#[derive(Debug)]
pub struct Metrics {
    pub sent: Family<Message, Counter>,
    pub received: Family<Message, Counter>,
    pub dropped: Family<Message, Counter>,
    pub errors: Counter,
    pub broadcast: Counter,
    pub queued: Gauge,
}

impl Metrics {
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            sent: Family::default(),
            received: Family::default(),
            dropped: Family::default(),
            errors: Counter::default(),
            broadcast: Counter::default(),
            queued: Gauge::default(),
        };
        registry.register(
            "messages_sent",
            "Total number of messages admitted for delivery",
            metrics.sent.clone(),
        );
        registry.register(
            "messages_received",
            "Total number of messages delivered to their destination",
            metrics.received.clone(),
        );
        registry.register(
            "messages_dropped",
            "Total number of messages lost to simulated loss or shutdown",
            metrics.dropped.clone(),
        );
        registry.register(
            "delivery_errors",
            "Total number of messages that could not be delivered",
            metrics.errors.clone(),
        );
        registry.register(
            "broadcast_deliveries",
            "Total number of endpoints reached by broadcasts",
            metrics.broadcast.clone(),
        );
        registry.register(
            "queued_messages",
            "Number of admitted messages awaiting delivery",
            metrics.queued.clone(),
        );
        metrics
    }
}
