//! Timer wheel driving the run loop's deadlines.
//!
//! Time is counted in [`Ticks`] from the owning loop's start; a
//! [`TickClock`] maps ticks to the monotonic clock.

mod slab;
mod time;
pub(crate) mod wheel;

pub use time::{Duration, TickClock, Ticks, TimeUnit, Timestamp};
pub use wheel::{PowerOfTwo, TimerHandle, Wheel, WheelConfig};
