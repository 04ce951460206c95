//! Store traits and PostgreSQL implementations.

pub mod bundle;
pub mod host;
pub mod job;
pub mod source;
pub mod trigger;

pub use bundle::{BundleStore, PgBundleStore};
pub use host::{HostStore, PgHostStore};
pub use job::{JobStore, PgJobStore};
pub use source::{PgSourceStore, SourceStore};
pub use trigger::{PgTriggerStore, TriggerStore};
