//! Deliver messages between endpoints over a simulated, unreliable network.
//!
//! [Network::send] decides synchronously whether a message is lost (according to
//! [Conditions::packet_loss]) and, if it survives, draws how long it will be held
//! (uniformly from [Conditions::delay_min] to [Conditions::delay_max]) before queueing it.
//! A single worker thread pops admitted messages in order, sleeps for their delay, and
//! hands them to the [Directory]. Because there is only one worker, delays accumulate:
//! throughput is bounded by roughly one message per mean delay.
//!
//! [Network::broadcast] models a reliable control channel: it skips the queue, the delay
//! and the loss decision entirely.
//!
//! # Shutdown
//!
//! [Network::stop] does not wait for queued messages to be delivered. The worker finishes
//! the delivery it is sleeping on (if any) and counts every message still queued as
//! dropped.

mod metrics;
pub mod protocol;
mod stats;

pub use protocol::{Profile, Protocol};
pub use stats::Stats;

use crate::{message::Message, Directory, Error};
use prometheus_client::registry::Registry;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, info, trace, warn};

/// Loss and latency applied to point-to-point messages.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Conditions {
    /// Probability of a message being dropped at admission (in range [0,1]).
    pub packet_loss: f64,

    /// Minimum time a message is held before delivery.
    pub delay_min: Duration,

    /// Maximum time a message is held before delivery. No delay is applied when zero.
    pub delay_max: Duration,
}

impl Conditions {
    /// Returns a copy with `packet_loss` clamped into [0,1] (`NaN` becomes `0`) and
    /// `delay_max` raised to at least `delay_min`.
    pub fn clamped(self) -> Self {
        let packet_loss = if self.packet_loss.is_nan() {
            0.0
        } else {
            self.packet_loss.clamp(0.0, 1.0)
        };
        Self {
            packet_loss,
            delay_min: self.delay_min,
            delay_max: self.delay_max.max(self.delay_min),
        }
    }
}

/// Configuration for a [Network].
pub struct Config {
    /// Registry the network's metrics are registered in.
    pub registry: Arc<Mutex<Registry>>,

    /// Seed for loss and delay decisions. When `None`, the generator is seeded from
    /// system entropy.
    pub seed: Option<u64>,

    /// Initial network conditions (corrected with [Conditions::clamped]).
    pub conditions: Conditions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            seed: None,
            conditions: Conditions::default(),
        }
    }
}

/// Lifecycle state of a [Network].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Stopped,
    Running,
}

/// An admitted message and the delay drawn for it.
struct Envelope {
    message: Message,
    delay: Duration,
}

struct Queue {
    pending: VecDeque<Envelope>,
    running: bool,
}

/// Randomness and the conditions it is drawn against.
struct Impairment {
    rng: StdRng,
    conditions: Conditions,
}

impl Impairment {
    /// Returns the delay to apply to an admitted message, or `None` if the message is lost.
    fn admit(&mut self) -> Option<Duration> {
        let Conditions {
            packet_loss,
            delay_min,
            delay_max,
        } = self.conditions;
        if packet_loss > 0.0 && self.rng.gen::<f64>() < packet_loss {
            return None;
        }
        if delay_max.is_zero() {
            return Some(Duration::ZERO);
        }
        Some(self.rng.gen_range(delay_min..=delay_max))
    }
}

struct Shared<D: Directory> {
    directory: Arc<D>,

    queue: Mutex<Queue>,
    ready: Condvar,

    impairment: Mutex<Impairment>,
    stats: Mutex<Stats>,
    protocols: Mutex<HashMap<String, Protocol>>,

    metrics: metrics::Metrics,
}

/// Implementation of a simulated, lossy network.
///
/// None of the internal locks are ever held together, and none are held while sleeping or
/// calling into the [Directory].
pub struct Network<D: Directory> {
    shared: Arc<Shared<D>>,

    // Serializes start and stop.
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Directory> Network<D> {
    /// Create a new (stopped) network that delivers through `directory`.
    pub fn new(directory: Arc<D>, cfg: Config) -> Self {
        let conditions = cfg.conditions.clamped();
        if conditions != cfg.conditions {
            warn!(
                requested = ?cfg.conditions,
                applied = ?conditions,
                "corrected invalid network conditions"
            );
        }
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let metrics = metrics::Metrics::init(&mut cfg.registry.lock().unwrap());

        Self {
            shared: Arc::new(Shared {
                directory,
                queue: Mutex::new(Queue {
                    pending: VecDeque::new(),
                    running: false,
                }),
                ready: Condvar::new(),
                impairment: Mutex::new(Impairment { rng, conditions }),
                stats: Mutex::new(Stats::new()),
                protocols: Mutex::new(HashMap::new()),
                metrics,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the delivery worker. Does nothing if the network is already running.
    pub fn start(&self) -> Result<(), Error> {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            debug!("network already running");
            return Ok(());
        }
        self.shared.queue.lock().unwrap().running = true;

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("network".into())
            .spawn(move || shared.run());
        match handle {
            Ok(handle) => *worker = Some(handle),
            Err(err) => {
                self.shared.queue.lock().unwrap().running = false;
                return Err(err.into());
            }
        }
        info!("network started");
        Ok(())
    }

    /// Stop the delivery worker and wait for it to exit.
    ///
    /// Messages still queued are counted as dropped. Does nothing if the network is not
    /// running.
    pub fn stop(&self) {
        let mut worker = self.worker.lock().unwrap();
        let Some(handle) = worker.take() else {
            debug!("network already stopped");
            return;
        };
        self.shared.queue.lock().unwrap().running = false;
        self.shared.ready.notify_all();
        if handle.join().is_err() {
            error!("network worker panicked");
        }
        info!("network stopped");
    }

    pub fn state(&self) -> State {
        if self.shared.queue.lock().unwrap().running {
            State::Running
        } else {
            State::Stopped
        }
    }

    /// Submit a message for delivery to its destination.
    ///
    /// Returns `false` if the message was lost at admission (it is counted as dropped and
    /// never queued). Returns `true` once the message is queued, which says nothing about
    /// whether it will eventually be delivered.
    pub fn send(&self, message: Message) -> bool {
        let admitted = self.shared.impairment.lock().unwrap().admit();
        let label = metrics::Message::new(message.kind());
        let Some(delay) = admitted else {
            self.shared.stats.lock().unwrap().dropped += 1;
            self.shared.metrics.dropped.get_or_create(&label).inc();
            trace!(
                id = %message.id(),
                source = message.source(),
                destination = message.destination(),
                "dropped message at admission"
            );
            return false;
        };

        // Count before queueing so snapshots never see more received than sent
        self.shared.stats.lock().unwrap().sent += 1;
        self.shared.metrics.sent.get_or_create(&label).inc();
        trace!(
            id = %message.id(),
            source = message.source(),
            destination = message.destination(),
            ?delay,
            "admitted message"
        );
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.pending.push_back(Envelope { message, delay });
            self.shared.metrics.queued.set(queue.pending.len() as i64);
        }
        self.shared.ready.notify_one();
        true
    }

    /// Deliver a message to every registered endpoint except its source, bypassing loss
    /// and delay. Returns the number of endpoints reached.
    pub fn broadcast(&self, message: Message) -> usize {
        let delivered = self
            .shared
            .directory
            .broadcast_except(message.source(), &message);
        self.shared.stats.lock().unwrap().sent += delivered as u64;
        self.shared.metrics.broadcast.inc_by(delivered as u64);
        debug!(
            id = %message.id(),
            source = message.source(),
            delivered,
            endpoints = self.shared.directory.count(),
            "broadcast message"
        );
        delivered
    }

    /// Replace the network conditions applied to subsequently admitted messages.
    ///
    /// Out-of-range values are corrected as described in [Conditions::clamped].
    pub fn set_conditions(&self, packet_loss: f64, delay_min: Duration, delay_max: Duration) {
        let requested = Conditions {
            packet_loss,
            delay_min,
            delay_max,
        };
        let conditions = requested.clamped();
        if conditions != requested {
            warn!(?requested, applied = ?conditions, "corrected invalid network conditions");
        }
        self.shared.impairment.lock().unwrap().conditions = conditions;
        info!(
            packet_loss = conditions.packet_loss,
            delay_min = ?conditions.delay_min,
            delay_max = ?conditions.delay_max,
            "updated network conditions"
        );
    }

    pub fn conditions(&self) -> Conditions {
        self.shared.impairment.lock().unwrap().conditions
    }

    /// Returns a consistent snapshot of the delivery statistics.
    pub fn stats(&self) -> Stats {
        *self.shared.stats.lock().unwrap()
    }

    /// Zero all counters and restart the uptime clock.
    pub fn reset_stats(&self) {
        *self.shared.stats.lock().unwrap() = Stats::new();
    }

    /// Number of admitted messages awaiting delivery.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().unwrap().pending.len()
    }

    /// Tag an endpoint with the protocol it communicates over.
    pub fn set_protocol(&self, endpoint: impl Into<String>, protocol: Protocol) {
        let endpoint = endpoint.into();
        info!(
            endpoint = %endpoint,
            protocol = protocol.profile().name,
            "configured endpoint protocol"
        );
        self.shared
            .protocols
            .lock()
            .unwrap()
            .insert(endpoint, protocol);
    }

    /// Returns the protocol an endpoint is tagged with ([Protocol::Custom] if untagged).
    pub fn protocol(&self, endpoint: &str) -> Protocol {
        self.shared
            .protocols
            .lock()
            .unwrap()
            .get(endpoint)
            .copied()
            .unwrap_or_default()
    }
}

impl<D: Directory> Drop for Network<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<D: Directory> Shared<D> {
    fn run(&self) {
        debug!("network worker started");
        loop {
            let Envelope { message, delay } = {
                let mut queue = self.queue.lock().unwrap();
                while queue.pending.is_empty() && queue.running {
                    queue = self.ready.wait(queue).unwrap();
                }
                if !queue.running {
                    let discarded: Vec<_> = queue.pending.drain(..).collect();
                    self.metrics.queued.set(0);
                    drop(queue);
                    self.discard(discarded);
                    break;
                }
                let Some(envelope) = queue.pending.pop_front() else {
                    continue;
                };
                self.metrics.queued.set(queue.pending.len() as i64);
                envelope
            };
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            self.deliver(message);
        }
        debug!("network worker exited");
    }

    fn deliver(&self, message: Message) {
        let id = message.id();
        let label = metrics::Message::new(message.kind());
        let delivered = match self.directory.lookup(message.destination()) {
            None => {
                warn!(
                    %id,
                    source = message.source(),
                    destination = message.destination(),
                    "destination not found, dropping message"
                );
                false
            }
            Some(handle) => {
                let destination = message.destination().to_string();
                match self.directory.deliver(&handle, message) {
                    Ok(()) => {
                        trace!(%id, %destination, "delivered message");
                        true
                    }
                    Err(err) => {
                        warn!(%id, %destination, ?err, "failed to deliver message");
                        false
                    }
                }
            }
        };

        {
            let mut stats = self.stats.lock().unwrap();
            if delivered {
                stats.received += 1;
            } else {
                stats.errors += 1;
            }
        }
        if delivered {
            self.metrics.received.get_or_create(&label).inc();
        } else {
            self.metrics.errors.inc();
        }
    }

    fn discard(&self, discarded: Vec<Envelope>) {
        if discarded.is_empty() {
            return;
        }
        self.stats.lock().unwrap().dropped += discarded.len() as u64;
        for Envelope { message, .. } in &discarded {
            self.metrics
                .dropped
                .get_or_create(&metrics::Message::new(message.kind()))
                .inc();
        }
        info!(
            dropped = discarded.len(),
            "discarded queued messages at shutdown"
        );
    }
}
