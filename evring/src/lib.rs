//! Shared-page byte rings, coalescing event channels and a blocking run loop.
//!
//! Two execution contexts (threads or processes) exchange bytes through a
//! [`SharedPage`](page::SharedPage) holding one ring per direction, ring
//! each other's doorbell through [`EventChannel`](event::EventChannel)s, and
//! sleep in [`Scheduler::block_until`](sched::Scheduler::block_until)
//! instead of polling. [`RunLoop`](runtime::RunLoop) ties these together
//! for a single-threaded, cooperative context.

// Allow the crate to reference itself as ::evring for derive macro usage
extern crate self as evring;

pub mod connection;
pub mod event;
pub mod host;
pub mod ipc;
pub mod page;
pub mod ring;
pub mod runtime;
pub mod sched;
mod trace;

pub use trace::init_tracing;

#[doc(inline)]
pub use evring_derive::SharedMemorySafe;

#[doc(inline)]
pub use ipc::shmem::SharedMemorySafe;

// Hidden re-export for the derive macro
#[doc(hidden)]
pub use ipc::shmem::SharedMemorySafe as __SharedMemorySafePrivate;
