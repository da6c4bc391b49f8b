//! Single-threaded run loop over a set of connections.
//!
//! Each iteration:
//!
//! 1. For every connection, consume its doorbell and drain its ring into
//!    [`Application::on_data`], at most one ring's worth per connection so
//!    a chatty peer cannot starve the others.
//! 2. Advance the timer wheel and hand due timers to
//!    [`Application::on_timer`].
//! 3. If neither produced work, block in [`Scheduler::block_until`] until the
//!    next timer (capped by [`RunLoopConfig::max_block`]) or an event.
//!
//! The doorbell is consumed *before* the ring is read, so a notify racing
//! with the drain leaves the pending bit set and the next block returns at
//! once. Protocol violations tear down only the offending connection and
//! are reported through [`Application::on_teardown`]. Host failures end
//! [`RunLoop::run`] with [`RunError::Host`].

use std::fmt;
use std::mem;
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use minstant::Instant;
use serde::{Deserialize, Serialize};

use crate::connection::{Connection, ConnectionError};
use crate::event::{Delivery, EventError, EventTable, Port};
use crate::host::{Host, HostError};
use crate::page::SharedPage;
use crate::runtime::timing::{self, PowerOfTwo, TickClock, TimerHandle, Wheel, WheelConfig};
use crate::sched::{Deadline, Scheduler};
use crate::trace::{debug, error, info, trace, warn};

/// Run loop tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunLoopConfig {
    /// Largest slice handed to a single [`Application::on_data`] call.
    pub read_chunk: usize,
    /// Timer wheel slots. Must be a power of two.
    pub wheel_slots: usize,
    /// Timer resolution.
    pub tick: Duration,
    /// Timers that may be pending at once.
    pub timer_capacity: usize,
    /// Longest a single idle block may last. `None` sleeps until an event or
    /// the next timer.
    pub max_block: Option<Duration>,
    /// Return from [`RunLoop::run`] once the last connection is gone.
    pub exit_when_idle: bool,
}

impl Default for RunLoopConfig {
    fn default() -> Self {
        Self {
            read_chunk: 4096,
            wheel_slots: 256,
            tick: Duration::from_millis(1),
            timer_capacity: 1024,
            max_block: Some(Duration::from_secs(10)),
            exit_when_idle: false,
        }
    }
}

/// Errors that end [`RunLoop::run`] or prevent building a loop.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The host could not sleep or wake. Fatal.
    #[error(transparent)]
    Host(#[from] HostError),
    /// The loop's own event table refused an operation.
    #[error(transparent)]
    Event(#[from] EventError),
    #[error("invalid run loop config: {reason}")]
    InvalidConfig { reason: &'static str },
}

/// Identifies a connection registered with a [`RunLoop`]. Never reused
/// within one loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(usize);

impl ConnectionId {
    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Counters kept by a [`RunLoop`] across calls to [`RunLoop::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub iterations: u64,
    /// Calls into the scheduler.
    pub blocks: u64,
    /// Blocks that returned early with nothing to do.
    pub spurious_wakeups: u64,
    pub bytes_received: u64,
    pub timers_fired: u64,
}

/// What callbacks may do to the loop that invoked them.
pub trait Context<X> {
    /// Write what fits to a connection and notify its peer.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::TornDown`] for unknown or torn down connections.
    /// A protocol violation also schedules the connection's teardown.
    fn send(&mut self, id: ConnectionId, bytes: &[u8]) -> Result<usize, ConnectionError>;

    /// Fire `payload` after `delay`, rounded up to the loop's tick. `None`
    /// when the timer capacity is exhausted.
    fn schedule(&mut self, delay: Duration, payload: X) -> Option<TimerHandle<X>>;

    /// `false` if the timer already fired or was cancelled.
    fn cancel(&mut self, handle: TimerHandle<X>) -> bool;

    /// Return from [`RunLoop::run`] once the current callback finishes.
    fn stop(&mut self);

    fn now(&self) -> Instant;
}

/// Callbacks driven by a [`RunLoop`].
pub trait Application {
    /// Payload carried by this application's timers.
    type Timer;

    fn on_start(&mut self, _cx: &mut dyn Context<Self::Timer>) {}

    /// Bytes arrived on `id`.
    fn on_data(&mut self, cx: &mut dyn Context<Self::Timer>, id: ConnectionId, data: &[u8]);

    fn on_timer(
        &mut self,
        _cx: &mut dyn Context<Self::Timer>,
        _handle: TimerHandle<Self::Timer>,
        _payload: Self::Timer,
    ) {
    }

    /// `id` was torn down because of `err` and removed from the loop.
    fn on_teardown(
        &mut self,
        _cx: &mut dyn Context<Self::Timer>,
        _id: ConnectionId,
        _err: &ConnectionError,
    ) {
    }
}

/// Stops a [`RunLoop`] from another thread, waking it if it is blocked.
#[derive(Clone)]
pub struct StopHandle<T, H> {
    flag: Arc<AtomicBool>,
    table: T,
    port: Port,
    host: H,
}

impl<T: Deref<Target = EventTable>, H: Host> StopHandle<T, H> {
    /// Request the loop to return from [`RunLoop::run`]. Permanent.
    ///
    /// # Errors
    ///
    /// [`HostError::Wake`] if the blocked loop could not be woken.
    pub fn stop(&self) -> Result<(), HostError> {
        self.flag.store(true, Ordering::SeqCst);
        match self.table.raise(self.port) {
            Ok(Delivery::Wake) => self.host.wake(self.table.wake_word()),
            // Already awake, or the loop is gone.
            Ok(_) | Err(_) => Ok(()),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl<T, H> fmt::Debug for StopHandle<T, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("port", &self.port)
            .field("stopped", &self.flag.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// The state callbacks can reach through [`Context`].
struct Core<P, T, H, X, const N: usize> {
    connections: Vec<Option<Connection<P, T, H, N>>>,
    wheel: Wheel<X>,
    clock: TickClock,
    stop: Arc<AtomicBool>,
    teardowns: Vec<(ConnectionId, ConnectionError)>,
    fatal: Option<HostError>,
}

impl<P, T, H, X, const N: usize> Core<P, T, H, X, N>
where
    P: Deref<Target = SharedPage<N>>,
    T: Deref<Target = EventTable>,
    H: Host,
{
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Violations queue a teardown; host failures end the loop.
    fn note(&mut self, id: ConnectionId, err: ConnectionError) {
        match err {
            ConnectionError::Event(EventError::Host(host))
            | ConnectionError::Unnotified {
                source: EventError::Host(host),
                ..
            } => {
                error!(%id, %host, "failed to wake peer");
                self.fatal.get_or_insert(host);
            }
            err if err.is_protocol_violation() => self.teardowns.push((id, err)),
            _ => {}
        }
    }
}

impl<P, T, H, X, const N: usize> Context<X> for Core<P, T, H, X, N>
where
    P: Deref<Target = SharedPage<N>>,
    T: Deref<Target = EventTable>,
    H: Host,
{
    fn send(&mut self, id: ConnectionId, bytes: &[u8]) -> Result<usize, ConnectionError> {
        let conn = self
            .connections
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(ConnectionError::TornDown)?;
        let result = conn.send(bytes);
        if let Err(err) = result {
            self.note(id, err);
        }
        result
    }

    fn schedule(&mut self, delay: Duration, payload: X) -> Option<TimerHandle<X>> {
        let due = self.clock.now() + self.clock.ticks(delay);
        // The wheel counts delays from the tick after its cursor.
        let first = self.wheel.cursor() + timing::Duration::new(1);
        let handle = self.wheel.schedule(due.saturating_since(first), payload);
        if handle.is_none() {
            warn!(pending = self.wheel.len(), "timer capacity exhausted");
        }
        handle
    }

    fn cancel(&mut self, handle: TimerHandle<X>) -> bool {
        self.wheel.cancel(handle)
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// One context's cooperative loop: connections, timers and the scheduler.
///
/// `T` is a handle to the context's own [`EventTable`], where every
/// connection's local port and the loop's stop port are bound.
pub struct RunLoop<P, T, H, A, const N: usize>
where
    P: Deref<Target = SharedPage<N>>,
    T: Deref<Target = EventTable>,
    H: Host,
    A: Application,
{
    app: A,
    core: Core<P, T, H, A::Timer, N>,
    sched: Scheduler<T, H>,
    stop_port: Port,
    scratch: Vec<u8>,
    fired: Vec<(TimerHandle<A::Timer>, A::Timer)>,
    max_block: Option<Duration>,
    exit_when_idle: bool,
    stats: LoopStats,
}

impl<P, T, H, A, const N: usize> RunLoop<P, T, H, A, N>
where
    P: Deref<Target = SharedPage<N>>,
    T: Deref<Target = EventTable>,
    H: Host,
    A: Application,
{
    /// Build a loop blocking on `table` through `host`.
    ///
    /// # Errors
    ///
    /// [`RunError::InvalidConfig`] for a zero chunk, tick or timer capacity
    /// or a wheel size that is not a power of two. [`RunError::Event`] if
    /// `table` has no free port left for the stop doorbell.
    pub fn new(config: RunLoopConfig, table: T, host: H, app: A) -> Result<Self, RunError> {
        let invalid = |reason: &'static str| RunError::InvalidConfig { reason };
        let slots = PowerOfTwo::new(config.wheel_slots)
            .ok_or_else(|| invalid("wheel_slots must be a power of two"))?;
        let capacity = NonZeroUsize::new(config.timer_capacity)
            .ok_or_else(|| invalid("timer_capacity must be non-zero"))?;
        if config.read_chunk == 0 {
            return Err(invalid("read_chunk must be non-zero"));
        }
        let clock =
            TickClock::start(config.tick).ok_or_else(|| invalid("tick must be non-zero"))?;

        let stop_port = table.bind()?;
        info!(
            %stop_port,
            tick_us = config.tick.as_micros() as u64,
            max_block_ms = config.max_block.map(|d| d.as_millis() as u64),
            "run loop created"
        );

        Ok(Self {
            app,
            core: Core {
                connections: Vec::new(),
                wheel: Wheel::new(WheelConfig { slots, capacity }),
                clock,
                stop: Arc::new(AtomicBool::new(false)),
                teardowns: Vec::new(),
                fatal: None,
            },
            sched: Scheduler::new(table, host),
            stop_port,
            scratch: vec![0; config.read_chunk],
            fired: Vec::new(),
            max_block: config.max_block,
            exit_when_idle: config.exit_when_idle,
            stats: LoopStats::default(),
        })
    }

    /// Register a connection whose local port is bound in this loop's table.
    pub fn add_connection(&mut self, conn: Connection<P, T, H, N>) -> ConnectionId {
        let id = ConnectionId(self.core.connections.len());
        debug!(%id, side = %conn.side(), "connection added");
        self.core.connections.push(Some(conn));
        id
    }

    /// Unregister a connection without tearing it down.
    pub fn remove_connection(&mut self, id: ConnectionId) -> Option<Connection<P, T, H, N>> {
        self.core.connections.get_mut(id.0).and_then(Option::take)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection<P, T, H, N>> {
        self.core.connections.get(id.0).and_then(Option::as_ref)
    }

    /// Live connections.
    pub fn connection_count(&self) -> usize {
        self.core.connections.iter().flatten().count()
    }

    pub fn stop_handle(&self) -> StopHandle<T, H>
    where
        T: Clone,
        H: Clone,
    {
        StopHandle {
            flag: Arc::clone(&self.core.stop),
            table: self.sched.table().clone(),
            port: self.stop_port,
            host: self.sched.host().clone(),
        }
    }

    #[inline]
    pub fn app(&self) -> &A {
        &self.app
    }

    #[inline]
    pub fn app_mut(&mut self) -> &mut A {
        &mut self.app
    }

    #[inline]
    pub const fn stats(&self) -> &LoopStats {
        &self.stats
    }

    /// Run until stopped, until the last connection is gone (with
    /// [`RunLoopConfig::exit_when_idle`]), or until the host fails.
    ///
    /// # Errors
    ///
    /// [`RunError::Host`] if the host cannot sleep or wake a peer,
    /// [`RunError::Event`] if the loop's stop port was closed under it.
    pub fn run(&mut self) -> Result<(), RunError> {
        info!(connections = self.connection_count(), "run loop starting");
        let result = self.run_inner();
        match &result {
            Ok(()) => {
                info!(stats = ?self.stats, "run loop stopped");
            }
            Err(_err) => {
                error!(err = %_err, stats = ?self.stats, "run loop failed");
            }
        }
        result
    }

    fn run_inner(&mut self) -> Result<(), RunError> {
        self.app.on_start(&mut self.core);
        let mut woke_from: Option<Deadline> = None;
        loop {
            self.stats.iterations += 1;
            self.settle()?;
            if self.core.stopped() {
                return Ok(());
            }
            // The stop port only exists to wake us; its flag is the signal.
            self.sched.table().consume_pending(self.stop_port)?;

            let mut busy = self.poll_connections();
            busy |= self.fire_timers();
            self.settle()?;
            if self.core.stopped() {
                return Ok(());
            }
            if self.exit_when_idle && self.connection_count() == 0 {
                debug!("no connections left");
                return Ok(());
            }
            if busy {
                woke_from = None;
                continue;
            }

            if let Some(deadline) = woke_from.take()
                && !deadline.has_passed()
            {
                self.stats.spurious_wakeups += 1;
                trace!("woke with nothing to do");
            }
            let deadline = self.next_deadline();
            self.stats.blocks += 1;
            self.sched.block_until(deadline)?;
            woke_from = Some(deadline);
        }
    }

    /// Report queued teardowns, then surface a host failure if one happened.
    fn settle(&mut self) -> Result<(), RunError> {
        while !self.core.teardowns.is_empty() {
            for (id, err) in mem::take(&mut self.core.teardowns) {
                if let Some(mut conn) = self.core.connections.get_mut(id.0).and_then(Option::take)
                {
                    conn.teardown();
                    warn!(%id, %err, "connection removed");
                    self.app.on_teardown(&mut self.core, id, &err);
                }
            }
        }
        match self.core.fatal.take() {
            Some(err) => Err(RunError::Host(err)),
            None => Ok(()),
        }
    }

    fn poll_connections(&mut self) -> bool {
        let mut busy = false;
        for idx in 0..self.core.connections.len() {
            let id = ConnectionId(idx);
            let Some(conn) = self.core.connections[idx].as_mut() else {
                continue;
            };
            if conn.is_torn_down() {
                continue;
            }
            if let Err(err) = conn.consume_pending() {
                self.core.note(id, err);
                continue;
            }

            let mut budget = N;
            while budget > 0 {
                let Some(conn) = self.core.connections[idx].as_mut() else {
                    break;
                };
                let want = self.scratch.len().min(budget);
                match conn.recv(&mut self.scratch[..want]) {
                    Ok(0) => break,
                    Ok(n) => {
                        busy = true;
                        budget -= n;
                        self.stats.bytes_received += n as u64;
                        self.app.on_data(&mut self.core, id, &self.scratch[..n]);
                        if self.core.fatal.is_some() || self.core.stopped() {
                            return busy;
                        }
                    }
                    Err(err) => {
                        self.core.note(id, err);
                        break;
                    }
                }
            }
        }
        busy
    }

    fn fire_timers(&mut self) -> bool {
        let now = self.core.clock.now();
        let fired = &mut self.fired;
        self.core
            .wheel
            .tick(now, |handle, payload| fired.push((handle, payload)));
        if self.fired.is_empty() {
            return false;
        }

        let mut fired = mem::take(&mut self.fired);
        for (handle, payload) in fired.drain(..) {
            self.stats.timers_fired += 1;
            self.app.on_timer(&mut self.core, handle, payload);
        }
        self.fired = fired;
        true
    }

    fn next_deadline(&self) -> Deadline {
        let timer = self
            .core
            .wheel
            .next_deadline()
            .map_or(Deadline::Never, |tick| self.core.clock.deadline(tick));
        let cap = self.max_block.map_or(Deadline::Never, Deadline::after);
        timer.min(cap)
    }
}

impl<P, T, H, A, const N: usize> Drop for RunLoop<P, T, H, A, N>
where
    P: Deref<Target = SharedPage<N>>,
    T: Deref<Target = EventTable>,
    H: Host,
    A: Application,
{
    fn drop(&mut self) {
        for conn in self.core.connections.iter_mut().flatten() {
            conn.teardown();
        }
        let _ = self.sched.table().close(self.stop_port);
    }
}
