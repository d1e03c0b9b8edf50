//! Fire callbacks against a virtual clock.
//!
//! A [Scheduler] owns a single worker thread that advances a virtual clock by a fixed
//! `time_step` per step and then sleeps `time_step / speed` of wall time. After each advance,
//! every event whose scheduled time is at or before the virtual clock fires, ordered by
//! scheduled time, then descending priority, then submission order. Event times are therefore
//! quantized to the step: an event due between two steps fires on the later one.
//!
//! Repeating events are re-enqueued `interval` after the virtual time they fired at, so the
//! wall time spent inside a callback never shifts the schedule.
//!
//! Callbacks run on the worker thread without any scheduler lock held. They may schedule,
//! cancel, pause or stop. A callback that panics is logged and counted, and does not affect
//! other events.
//!
//! # Virtual Time
//!
//! The virtual clock starts at the wall-clock instant [Scheduler::start] is first called.
//! Events scheduled before then are shifted onto that instant, keeping their relative delays.
//!
//! Pausing freezes the virtual clock, so an event scheduled with a non-zero delay never
//! becomes due during a pause. Only zero-delay events submitted while paused accumulate, and
//! they fire in order on the first step after [Scheduler::resume].

mod event;
mod metrics;

use crate::{utils::panic_message, Error};
use event::{Action, Event};
use prometheus_client::registry::Registry;
use std::{
    collections::BinaryHeap,
    mem,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle, ThreadId},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error, info, trace, warn};

/// Slowest supported speed multiplier.
pub const MIN_SPEED: f64 = 0.01;

/// Fastest supported speed multiplier.
pub const MAX_SPEED: f64 = 10_000.0;

/// Smallest supported clock step.
pub const MIN_TIME_STEP: Duration = Duration::from_millis(1);

/// Configuration for a [Scheduler].
#[derive(Clone, Debug)]
pub struct Config {
    /// Registry for scheduler metrics.
    pub registry: Arc<Mutex<Registry>>,

    /// Virtual time added to the clock on every step.
    pub time_step: Duration,

    /// Multiplier applied to the passage of virtual time. Clamped to
    /// [MIN_SPEED]..=[MAX_SPEED].
    pub speed: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            time_step: Duration::from_millis(10),
            speed: 1.0,
        }
    }
}

/// Optional attributes of a scheduled event.
#[derive(Clone, Debug, Default)]
pub struct Options {
    /// Identifier used to cancel the event. Generated if not provided.
    pub id: Option<String>,

    /// Events due at the same virtual time fire in descending priority.
    pub priority: i32,
}

impl Options {
    /// Sets the identifier used by [Scheduler::cancel].
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the priority used to order events due at the same instant.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Lifecycle of a [Scheduler].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Stopped,
    Running,
    /// The worker is parked and the virtual clock is frozen.
    Paused,
}

/// Snapshot of scheduler activity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stats {
    pub steps: u64,
    pub fired: u64,
    pub faults: u64,
    pub pending: usize,
}

struct Control {
    state: State,
    speed: f64,
    started: Option<SystemTime>,
    worker: Option<ThreadId>,
}

struct Queue {
    now: SystemTime,
    events: BinaryHeap<Event>,
    sequence: u64,
    steps: u64,

    /// Id of the event currently firing and whether it repeats.
    executing: Option<(String, bool)>,
    cancelled: bool,

    stopping: bool,
}

impl Queue {
    fn next_sequence(&mut self) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;
        sequence
    }

    fn is_due(&self) -> bool {
        self.events.peek().is_some_and(|event| event.time <= self.now)
    }
}

struct Shared {
    time_step: Duration,

    control: Mutex<Control>,
    resumed: Condvar,

    queue: Mutex<Queue>,
    wake: Condvar,

    metrics: metrics::Metrics,
}

/// Virtual-clock event scheduler.
///
/// Lock order is `worker`, then `control`, then `queue`. `control` and `queue` are never held
/// at the same time, and neither is held while a callback runs or is dropped.
pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a stopped scheduler.
    pub fn new(cfg: Config) -> Self {
        let speed = clamp_speed(cfg.speed);
        if speed != cfg.speed {
            warn!(requested = cfg.speed, applied = speed, "speed clamped");
        }
        let time_step = cfg.time_step.max(MIN_TIME_STEP);
        if time_step != cfg.time_step {
            warn!(requested = ?cfg.time_step, applied = ?time_step, "time step raised");
        }
        let metrics = metrics::Metrics::init(&mut cfg.registry.lock().unwrap());
        Self {
            shared: Arc::new(Shared {
                time_step,
                control: Mutex::new(Control {
                    state: State::Stopped,
                    speed,
                    started: None,
                    worker: None,
                }),
                resumed: Condvar::new(),
                queue: Mutex::new(Queue {
                    now: UNIX_EPOCH,
                    events: BinaryHeap::new(),
                    sequence: 0,
                    steps: 0,
                    executing: None,
                    cancelled: false,
                    stopping: false,
                }),
                wake: Condvar::new(),
                metrics,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the worker thread. Does nothing if already running or paused.
    ///
    /// A callback cannot restart a scheduler it stopped: the call is ignored because the
    /// stopping worker is still running that callback. Restart from another thread instead.
    pub fn start(&self) -> Result<(), Error> {
        if self.on_worker() {
            let state = self.state();
            if state == State::Stopped {
                debug!("ignoring start from a callback of the stopping worker");
            } else {
                debug!(?state, "scheduler already started");
            }
            return Ok(());
        }
        let mut worker = self.lifecycle();
        {
            let control = self.shared.control.lock().unwrap();
            if control.state != State::Stopped {
                debug!(state = ?control.state, "scheduler already started");
                return Ok(());
            }
        }

        // Left behind when the worker stopped itself from a callback
        join(&mut worker);

        let started = {
            let mut queue = self.shared.queue.lock().unwrap();
            let started = SystemTime::now().max(queue.now);
            let shift = started.duration_since(queue.now).unwrap_or_default();
            if !shift.is_zero() {
                queue.events = mem::take(&mut queue.events)
                    .into_iter()
                    .map(|mut event| {
                        event.time += shift;
                        event
                    })
                    .collect();
            }
            queue.now = started;
            queue.stopping = false;
            started
        };
        {
            let mut control = self.shared.control.lock().unwrap();
            control.state = State::Running;
            control.started = Some(started);
        }

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("scheduler".into())
            .spawn(move || shared.run());
        match handle {
            Ok(handle) => {
                *worker = Some(handle);
                info!(time_step = ?self.shared.time_step, "scheduler started");
                Ok(())
            }
            Err(err) => {
                self.shared.control.lock().unwrap().state = State::Stopped;
                error!(?err, "failed to spawn scheduler worker");
                Err(Error::Spawn(err))
            }
        }
    }

    /// Stop the worker and discard every pending event without firing it.
    ///
    /// Blocks until the worker exits, unless called from a callback, in which case the worker
    /// exits once that callback returns.
    pub fn stop(&self) {
        let mut worker = if self.on_worker() {
            None
        } else {
            Some(self.lifecycle())
        };

        let already = {
            let mut control = self.shared.control.lock().unwrap();
            mem::replace(&mut control.state, State::Stopped) == State::Stopped
        };
        if !already {
            self.shared.resumed.notify_all();
            self.shared.queue.lock().unwrap().stopping = true;
            self.shared.wake.notify_all();
        }
        if let Some(worker) = worker.as_mut() {
            join(worker);
        }
        drop(worker);
        if already {
            debug!("scheduler already stopped");
            return;
        }

        let discarded = {
            let mut queue = self.shared.queue.lock().unwrap();
            self.shared.metrics.pending.set(0);
            mem::take(&mut queue.events)
        };
        info!(discarded = discarded.len(), "scheduler stopped");
    }

    /// Returns whether the caller is a callback running on the worker thread.
    fn on_worker(&self) -> bool {
        self.shared.control.lock().unwrap().worker == Some(thread::current().id())
    }

    /// Lock the worker handle. Joins never panic while it is held, but [Drop] must not
    /// panic either, so a poisoned lock is recovered.
    fn lifecycle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park the worker and freeze the virtual clock. Only valid while running.
    pub fn pause(&self) {
        let mut control = self.shared.control.lock().unwrap();
        if control.state != State::Running {
            debug!(state = ?control.state, "ignoring pause");
            return;
        }
        control.state = State::Paused;
        info!("scheduler paused");
    }

    /// Resume a paused scheduler. Events that became due while paused fire on the next step.
    pub fn resume(&self) {
        {
            let mut control = self.shared.control.lock().unwrap();
            if control.state != State::Paused {
                debug!(state = ?control.state, "ignoring resume");
                return;
            }
            control.state = State::Running;
        }
        self.shared.resumed.notify_all();
        info!("scheduler resumed");
    }

    pub fn state(&self) -> State {
        self.shared.control.lock().unwrap().state
    }

    /// Change the speed multiplier, clamped to [MIN_SPEED]..=[MAX_SPEED]. Takes effect from
    /// the next step.
    pub fn set_speed(&self, speed: f64) {
        let applied = clamp_speed(speed);
        if applied != speed {
            warn!(requested = speed, applied, "speed clamped");
        }
        self.shared.control.lock().unwrap().speed = applied;
        info!(speed = applied, "scheduler speed set");
    }

    pub fn speed(&self) -> f64 {
        self.shared.control.lock().unwrap().speed
    }

    /// Current virtual time. Never decreases.
    pub fn current_time(&self) -> SystemTime {
        self.shared.queue.lock().unwrap().now
    }

    /// Virtual time at which the scheduler was last started.
    pub fn start_time(&self) -> Option<SystemTime> {
        self.shared.control.lock().unwrap().started
    }

    pub fn stats(&self) -> Stats {
        let (steps, pending) = {
            let queue = self.shared.queue.lock().unwrap();
            (queue.steps, queue.events.len())
        };
        Stats {
            steps,
            fired: self.shared.metrics.fired.get(),
            faults: self.shared.metrics.faults.get(),
            pending,
        }
    }

    /// Fire `callback` once, `delay` after the current virtual time. Returns the event id.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> String
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_with(delay, Options::default(), callback)
    }

    /// Like [Scheduler::schedule] with an explicit id or priority.
    pub fn schedule_with<F>(&self, delay: Duration, options: Options, callback: F) -> String
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared
            .enqueue(delay, options, Action::Once(Box::new(callback)))
    }

    /// Fire `callback` every `interval`, starting one `interval` from now.
    pub fn schedule_repeating<F>(&self, interval: Duration, callback: F) -> Result<String, Error>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule_repeating_with(interval, Options::default(), callback)
    }

    /// Like [Scheduler::schedule_repeating] with an explicit id or priority.
    pub fn schedule_repeating_with<F>(
        &self,
        interval: Duration,
        options: Options,
        callback: F,
    ) -> Result<String, Error>
    where
        F: FnMut() + Send + 'static,
    {
        if interval.is_zero() {
            return Err(Error::ZeroInterval);
        }
        let action = Action::Repeat {
            interval,
            callback: Box::new(callback),
        };
        Ok(self.shared.enqueue(interval, options, action))
    }

    /// Remove every pending event with `id`. A repeating event that is firing right now will
    /// not be rescheduled. Returns whether anything was cancelled.
    pub fn cancel(&self, id: &str) -> bool {
        let (removed, in_flight) = {
            let mut queue = self.shared.queue.lock().unwrap();
            let (removed, kept): (Vec<_>, Vec<_>) = mem::take(&mut queue.events)
                .into_iter()
                .partition(|event| event.id == id);
            queue.events = kept.into();
            let in_flight = matches!(&queue.executing, Some((executing, true)) if executing == id);
            if in_flight {
                queue.cancelled = true;
            }
            self.shared.metrics.pending.set(queue.events.len() as i64);
            (removed, in_flight)
        };
        let cancelled = !removed.is_empty() || in_flight;
        debug!(id, removed = removed.len(), in_flight, "cancel requested");
        cancelled
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn enqueue(&self, delay: Duration, options: Options, action: Action) -> String {
        let id = {
            let mut queue = self.queue.lock().unwrap();
            let sequence = queue.next_sequence();
            let id = options.id.unwrap_or_else(|| format!("event-{sequence}"));
            let time = queue.now + delay;
            queue.events.push(Event {
                time,
                priority: options.priority,
                sequence,
                id: id.clone(),
                action,
            });
            self.metrics.pending.set(queue.events.len() as i64);
            id
        };
        self.wake.notify_one();
        self.metrics.scheduled.inc();
        trace!(%id, ?delay, priority = options.priority, "scheduled event");
        id
    }

    fn run(&self) {
        self.control.lock().unwrap().worker = Some(thread::current().id());
        debug!("scheduler worker started");
        while let Some(speed) = self.wait_until_running() {
            self.tick();
            self.dispatch();
            self.idle(self.time_step.div_f64(speed));
        }
        let mut control = self.control.lock().unwrap();
        if control.worker == Some(thread::current().id()) {
            control.worker = None;
        }
        debug!("scheduler worker exited");
    }

    /// Block while paused. Returns the current speed, or `None` once stopped.
    fn wait_until_running(&self) -> Option<f64> {
        let mut control = self.control.lock().unwrap();
        loop {
            match control.state {
                State::Running => return Some(control.speed),
                State::Paused => control = self.resumed.wait(control).unwrap(),
                State::Stopped => return None,
            }
        }
    }

    fn is_running(&self) -> bool {
        self.control.lock().unwrap().state == State::Running
    }

    fn tick(&self) {
        let mut queue = self.queue.lock().unwrap();
        queue.now += self.time_step;
        queue.steps += 1;
        self.metrics.steps.inc();
    }

    /// Fire every event due at or before the current virtual time, unless a callback (or
    /// another thread) pauses or stops the scheduler first.
    fn dispatch(&self) {
        loop {
            if !self.is_running() {
                return;
            }
            let event = {
                let mut queue = self.queue.lock().unwrap();
                if queue.stopping || !queue.is_due() {
                    return;
                }
                let Some(event) = queue.events.pop() else {
                    return;
                };
                queue.executing = Some((event.id.clone(), event.action.is_repeating()));
                queue.cancelled = false;
                self.metrics.pending.set(queue.events.len() as i64);
                event
            };
            self.fire(event);
        }
    }

    fn fire(&self, event: Event) {
        let Event {
            time,
            priority,
            id,
            action,
            ..
        } = event;
        trace!(%id, priority, ?time, "firing event");
        let (result, repeat) = match action {
            Action::Once(callback) => (catch_unwind(AssertUnwindSafe(callback)), None),
            Action::Repeat {
                interval,
                mut callback,
            } => {
                let result = catch_unwind(AssertUnwindSafe(|| callback()));
                (result, Some((interval, callback)))
            }
        };
        self.metrics.fired.inc();
        if let Err(err) = result {
            self.metrics.faults.inc();
            error!(%id, reason = %panic_message(err.as_ref()), "event callback panicked");
        }

        // Dropped after the lock is released: it may own the last handle to the scheduler
        let _discarded = {
            let mut queue = self.queue.lock().unwrap();
            queue.executing = None;
            let cancelled = mem::take(&mut queue.cancelled);
            match repeat {
                Some((interval, callback)) if !cancelled && !queue.stopping => {
                    let time = queue.now + interval;
                    let sequence = queue.next_sequence();
                    queue.events.push(Event {
                        time,
                        priority,
                        sequence,
                        id,
                        action: Action::Repeat { interval, callback },
                    });
                    self.metrics.pending.set(queue.events.len() as i64);
                    None
                }
                discarded => discarded,
            }
        };
    }

    /// Wait out the rest of a step. Events that become due meanwhile (zero-delay events
    /// scheduled from outside the worker) fire without waiting for the next step.
    fn idle(&self, wait: Duration) {
        let deadline = Instant::now() + wait;
        let mut queue = self.queue.lock().unwrap();
        loop {
            if queue.stopping {
                return;
            }
            if queue.is_due() {
                drop(queue);
                if !self.is_running() {
                    return;
                }
                self.dispatch();
                queue = self.queue.lock().unwrap();
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            queue = self.wake.wait_timeout(queue, remaining).unwrap().0;
        }
    }
}

fn join(worker: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = worker.take() {
        // Joining the current thread would fail, detach instead
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("scheduler worker panicked");
        }
    }
}

fn clamp_speed(speed: f64) -> f64 {
    if speed.is_nan() {
        return MIN_SPEED;
    }
    speed.clamp(MIN_SPEED, MAX_SPEED)
}
