//! Single background worker hosting the consumer's run loop.
//!
//! The worker moves through `NONE → STOPPED → RUNNING → NONE`. Shutdown is cooperative: the
//! requester flips the state to `STOPPED` and the worker notices at its next iteration boundary.
#![forbid(unsafe_code)]

mod clock;
mod error;
mod lifecycle;

pub use clock::{timeout_to_ticks, Blocker, DEFAULT_HZ};
pub use error::{Result, WorkerError};
pub use lifecycle::{Consumer, Shutdown, Step, Worker, WorkerConfig, WorkerState};
