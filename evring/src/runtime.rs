//! Cooperative run loop for one execution context.
//!
//! - `timing`: the timer wheel the loop schedules deadlines on.
//! - [`RunLoop`]: drains every connection's ring, fires due timers and
//!   blocks in the scheduler when there is nothing left to do.

mod run_loop;
pub mod timing;

pub use run_loop::{
    Application, ConnectionId, Context, LoopStats, RunError, RunLoop, RunLoopConfig, StopHandle,
};
