//! Wheel time: whole ticks counted from a loop's clock origin.
use core::marker::PhantomData;
use std::time;

use minstant::Instant;

use crate::sched::Deadline;

/// Marker trait for a time unit.
pub trait TimeUnit {
    /// Human-readable name for debugging.
    const NAME: &'static str;
}

/// One wheel tick; its length is set by the run loop configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Ticks {}
impl TimeUnit for Ticks {
    const NAME: &'static str = "ticks";
}

/// Span of time in a given unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Duration<U: TimeUnit>(pub u64, PhantomData<U>);

/// Point in time in a given unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Timestamp<U: TimeUnit>(pub u64, PhantomData<U>);

impl<U: TimeUnit> Duration<U> {
    #[inline]
    pub const fn new(value: u64) -> Self {
        Self(value, PhantomData)
    }

    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl<U: TimeUnit> Timestamp<U> {
    #[inline]
    pub const fn new(value: u64) -> Self {
        Self(value, PhantomData)
    }

    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Zero if `earlier` is actually later.
    #[inline]
    pub const fn saturating_since(self, earlier: Self) -> Duration<U> {
        Duration::new(self.0.saturating_sub(earlier.0))
    }
}

impl<U: TimeUnit> core::ops::Add<Duration<U>> for Timestamp<U> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Duration<U>) -> Self::Output {
        Timestamp::new(self.0.saturating_add(rhs.0))
    }
}

impl<U: TimeUnit> core::fmt::Display for Duration<U> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} {}", self.0, U::NAME)
    }
}

/// Maps the monotonic clock onto wheel ticks.
///
/// Tick `t` covers `[origin + t * tick, origin + (t + 1) * tick)`.
#[derive(Debug, Clone, Copy)]
pub struct TickClock {
    origin: Instant,
    tick_nanos: u128,
}

impl TickClock {
    /// Clock starting now. `None` for a zero tick.
    pub fn start(tick: time::Duration) -> Option<Self> {
        let tick_nanos = tick.as_nanos();
        (tick_nanos > 0).then(|| Self {
            origin: Instant::now(),
            tick_nanos,
        })
    }

    /// The tick the clock is in right now.
    pub fn now(&self) -> Timestamp<Ticks> {
        let ticks = self.origin.elapsed().as_nanos() / self.tick_nanos;
        Timestamp::new(u64::try_from(ticks).unwrap_or(u64::MAX))
    }

    /// `span` in ticks, rounded up: a timer never fires early.
    pub fn ticks(&self, span: time::Duration) -> Duration<Ticks> {
        let ticks = span.as_nanos().div_ceil(self.tick_nanos);
        Duration::new(u64::try_from(ticks).unwrap_or(u64::MAX))
    }

    /// When tick `at` begins.
    pub fn deadline(&self, at: Timestamp<Ticks>) -> Deadline {
        let nanos = self.tick_nanos.saturating_mul(u128::from(at.as_u64()));
        let offset = time::Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
        self.origin
            .checked_add(offset)
            .map_or(Deadline::Never, Deadline::At)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const MS: time::Duration = time::Duration::from_millis(1);

    #[test]
    fn zero_tick_is_rejected() {
        assert!(TickClock::start(time::Duration::ZERO).is_none());
    }

    #[test]
    fn spans_round_up_to_whole_ticks() {
        let clock = TickClock::start(MS).unwrap();
        assert_eq!(clock.ticks(time::Duration::ZERO).as_u64(), 0);
        assert_eq!(clock.ticks(time::Duration::from_nanos(1)).as_u64(), 1);
        assert_eq!(clock.ticks(MS).as_u64(), 1);
        assert_eq!(clock.ticks(time::Duration::from_micros(1500)).as_u64(), 2);
        assert_eq!(clock.ticks(time::Duration::MAX).as_u64(), u64::MAX);
    }

    #[test]
    fn now_advances_with_the_clock() {
        let clock = TickClock::start(MS).unwrap();
        let before = clock.now();
        thread::sleep(3 * MS);
        let after = clock.now();
        assert!(after.saturating_since(before).as_u64() >= 3);
        assert_eq!(before.saturating_since(after).as_u64(), 0);
    }

    #[test]
    fn deadline_is_the_start_of_the_tick() {
        let clock = TickClock::start(MS).unwrap();
        assert!(clock.deadline(Timestamp::new(0)).has_passed());
        let later = clock.deadline(clock.now() + Duration::new(1_000));
        assert!(!later.has_passed());
        let remaining = later.remaining().unwrap();
        assert!(remaining > 900 * MS && remaining <= 1_000 * MS, "{remaining:?}");
    }
}
