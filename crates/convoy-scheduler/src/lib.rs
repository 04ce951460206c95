//! Per-host job scheduling.
//!
//! Every host runs its own loop against the shared store: process
//! kill/wake-up flags, evict testing jobs to make room, claim pending jobs
//! up to free capacity, initialize claimed work and garbage-collect the
//! running phase. All cross-host coordination happens through the store's
//! claim contract; hosts never talk to each other.

pub mod error;
pub mod gc;
pub mod host_loop;
pub mod status;

pub use error::{SchedulerError, SchedulerResult};
pub use host_loop::HostRunner;
pub use status::StatusReporter;
