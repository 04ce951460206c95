//! KDL configuration parsing for the Convoy CI orchestrator.
//!
//! A single `convoy.kdl` file carries the system tunables: database
//! connection, batch quiet window, host capacity defaults and scheduler
//! knobs. Every field has a default so an absent file yields a usable
//! configuration.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{BatchConfig, HostConfig, SchedulerConfig, SystemConfig, VcsConfig};
