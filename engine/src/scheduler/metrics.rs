use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

#[derive(Debug)]
pub struct Metrics {
    pub steps: Counter,
    pub scheduled: Counter,
    pub fired: Counter,
    pub faults: Counter,
    pub pending: Gauge,
}

impl Metrics {
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            steps: Counter::default(),
            scheduled: Counter::default(),
            fired: Counter::default(),
            faults: Counter::default(),
            pending: Gauge::default(),
        };
        registry.register(
            "scheduler_steps",
            "Total number of virtual clock steps",
            metrics.steps.clone(),
        );
        registry.register(
            "events_scheduled",
            "Total number of events scheduled",
            metrics.scheduled.clone(),
        );
        registry.register(
            "events_fired",
            "Total number of event callbacks invoked",
            metrics.fired.clone(),
        );
        registry.register(
            "callback_faults",
            "Total number of event callbacks that panicked",
            metrics.faults.clone(),
        );
        registry.register(
            "events_pending",
            "Number of events waiting to fire",
            metrics.pending.clone(),
        );
        metrics
    }
}
