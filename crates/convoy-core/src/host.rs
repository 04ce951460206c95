//! Worker hosts and their capacity bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// A worker host. Each host runs its own scheduling loop against the shared
/// store; nothing here is host-to-host state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: ResourceId,
    pub name: String,
    pub display_name: String,
    /// Declared number of parallel testing slots.
    pub nb_workers: i32,
    /// Max jobs kept in the running phase on this host.
    pub running_max: i32,
    /// Host only processes jobs explicitly assigned to it; claims nothing.
    pub assigned_only: bool,
    pub active: bool,
    /// Set past the fetch-failure threshold; a degraded host claims nothing.
    pub degraded: bool,
    pub fetch_failure_count: i32,
    pub last_loop_start: Option<DateTime<Utc>>,
    pub last_loop_end: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
}

impl Host {
    pub fn new(name: impl Into<String>, nb_workers: i32, running_max: i32) -> Self {
        let name = name.into();
        Self {
            id: ResourceId::new(),
            display_name: name.clone(),
            name,
            nb_workers,
            running_max,
            assigned_only: false,
            active: true,
            degraded: false,
            fetch_failure_count: 0,
            last_loop_start: None,
            last_loop_end: None,
            last_success: None,
        }
    }

    /// Effective claim capacity: zero when degraded, inactive or reserved.
    pub fn claim_capacity(&self) -> i32 {
        if self.degraded || self.assigned_only || !self.active {
            0
        } else {
            self.nb_workers
        }
    }

    /// Record a fetch failure; returns true when the host just crossed the
    /// threshold and became degraded.
    pub fn record_fetch_failure(&mut self, threshold: i32) -> bool {
        self.fetch_failure_count += 1;
        if !self.degraded && self.fetch_failure_count >= threshold {
            self.degraded = true;
            return true;
        }
        false
    }

    /// A successful fetch resets the counter and clears degradation.
    pub fn record_fetch_success(&mut self) {
        self.fetch_failure_count = 0;
        self.degraded = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degrades_past_threshold_and_recovers() {
        let mut host = Host::new("runner-1", 2, 5);
        assert_eq!(host.claim_capacity(), 2);
        for _ in 0..4 {
            assert!(!host.record_fetch_failure(5));
        }
        assert!(host.record_fetch_failure(5));
        assert!(host.degraded);
        assert_eq!(host.claim_capacity(), 0);
        // already degraded, not reported twice
        assert!(!host.record_fetch_failure(5));

        host.record_fetch_success();
        assert!(!host.degraded);
        assert_eq!(host.fetch_failure_count, 0);
        assert_eq!(host.claim_capacity(), 2);
    }

    #[test]
    fn assigned_only_hosts_claim_nothing() {
        let mut host = Host::new("runner-2", 4, 5);
        host.assigned_only = true;
        assert_eq!(host.claim_capacity(), 0);
    }
}
