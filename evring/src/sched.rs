//! Blocking scheduler: suspend the context until an event or a deadline.
//!
//! [`Scheduler::block_until`] is the only place a context sleeps. It closes
//! the lost-wakeup window with a disable / check / sleep / enable sequence:
//!
//! 1. Disable delivery (a [`DeliveryGuard`] restores it on every exit path).
//! 2. Clear the wake word, then scan for pending unmasked ports and check
//!    the deadline. Either one ends the call without sleeping.
//! 3. Re-enable delivery for the sleep and scan once more: raises made while
//!    disabled marked ports pending but woke nobody. Only if nothing is
//!    pending does the host sleep on the wake word, which any raise from now
//!    on flips to 1 before waking.
//! 4. Disable again and drop the guard.
//!
//! Returns may be spurious; callers re-check their rings.
//!
//! [`DeliveryGuard`]: crate::event::DeliveryGuard

use std::ops::Deref;
use std::time::Duration;

use minstant::Instant;

use crate::event::EventTable;
use crate::host::{Host, HostError};
use crate::trace::{error, trace};

/// When a blocking call must return at the latest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Absolute point on the monotonic clock.
    At(Instant),
    /// Only an event ends the wait.
    Never,
}

impl Deadline {
    /// `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Instant::now()
            .checked_add(timeout)
            .map_or(Self::Never, Self::At)
    }

    pub fn has_passed(&self) -> bool {
        match self {
            Self::At(at) => Instant::now() >= *at,
            Self::Never => false,
        }
    }

    /// Time left, zero once passed; `None` for [`Deadline::Never`].
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Self::At(at) => Some(at.saturating_duration_since(Instant::now())),
            Self::Never => None,
        }
    }

    /// The earlier of two deadlines.
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        match (self, other) {
            (Self::Never, d) | (d, Self::Never) => d,
            (Self::At(a), Self::At(b)) => Self::At(a.min(b)),
        }
    }
}

impl From<Instant> for Deadline {
    fn from(at: Instant) -> Self {
        Self::At(at)
    }
}

/// Blocks one context on its event table.
///
/// `T` is any handle to the context's own [`EventTable`].
pub struct Scheduler<T, H> {
    table: T,
    host: H,
}

impl<T: Deref<Target = EventTable>, H: Host> Scheduler<T, H> {
    pub const fn new(table: T, host: H) -> Self {
        Self { table, host }
    }

    /// Suspend until a pending unmasked event exists or `deadline` passes.
    ///
    /// Returns immediately if an event is already pending (including one
    /// replayed by an unmask) or the deadline is already in the past.
    ///
    /// # Errors
    ///
    /// [`HostError`] if the host cannot sleep. Spurious returns are `Ok`.
    pub fn block_until(&self, deadline: Deadline) -> Result<(), HostError> {
        let table = &*self.table;
        let guard = table.disable_delivery();

        table.clear_wake_word();
        if table.has_deliverable() {
            trace!("event already pending; not blocking");
            return Ok(());
        }
        if deadline.has_passed() {
            trace!("deadline passed; not blocking");
            return Ok(());
        }

        guard.open();
        let result = if table.has_deliverable() {
            trace!("event raced with block; not blocking");
            Ok(())
        } else {
            trace!(timeout = ?deadline.remaining(), "blocking");
            self.host.wait(table.wake_word(), 0, deadline)
        };
        guard.close();

        if let Err(err) = &result {
            error!(%err, "host wait failed");
        }
        result
    }

    /// Current monotonic time.
    #[inline]
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    pub fn host(&self) -> &H {
        &self.host
    }
}
