//! Engine counters
//!
//! Every counter is an atomic updated with relaxed ordering; a
//! [`MetricsSnapshot`] is a momentary, serializable copy.
//!
//! ```
//! use ike_proto::ipsec::metrics::EngineMetrics;
//!
//! let metrics = EngineMetrics::new();
//! metrics.record_ike_sa_created();
//! metrics.record_half_open(3);
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.ike_sa_active, 1);
//! assert_eq!(snapshot.half_open_peak, 3);
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Engine-wide counters
///
/// Cloning shares the counters.
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    counters: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    ike_sa_created: AtomicU64,
    ike_sa_deleted: AtomicU64,
    ike_sa_established: AtomicU64,
    half_open_peak: AtomicU64,
    child_sa_created: AtomicU64,
    child_sa_deleted: AtomicU64,
    cookies_issued: AtomicU64,
    cookies_verified: AtomicU64,
    half_open_refused: AtomicU64,
    parse_failures: AtomicU64,
    policy_failures: AtomicU64,
    commands_dispatched: AtomicU64,
    commands_undeliverable: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    /// IKE SAs ever created
    pub ike_sa_created: u64,
    /// IKE SAs removed
    pub ike_sa_deleted: u64,
    /// IKE SAs currently registered
    pub ike_sa_active: u64,
    /// IKE SAs that reached ESTABLISHED
    pub ike_sa_established: u64,
    /// Highest half-open count seen
    pub half_open_peak: u64,
    /// Child SAs registered
    pub child_sa_created: u64,
    /// Child SAs removed
    pub child_sa_deleted: u64,
    /// Child SAs currently registered
    pub child_sa_active: u64,
    /// Cookie challenges sent
    pub cookies_issued: u64,
    /// Valid cookies received
    pub cookies_verified: u64,
    /// IKE_SA_INIT requests refused at the half-open limit
    pub half_open_refused: u64,
    /// Datagrams dropped as malformed
    pub parse_failures: u64,
    /// Negotiations failed on policy
    pub policy_failures: u64,
    /// Commands delivered to an IKE SA
    pub commands_dispatched: u64,
    /// Commands with no target SA
    pub commands_undeliverable: u64,
}

impl EngineMetrics {
    /// Create zeroed metrics
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record IKE SA creation
    pub fn record_ike_sa_created(&self) {
        Self::bump(&self.counters.ike_sa_created);
    }

    /// Record IKE SA removal
    pub fn record_ike_sa_deleted(&self) {
        Self::bump(&self.counters.ike_sa_deleted);
    }

    /// Record an IKE SA reaching ESTABLISHED
    pub fn record_ike_sa_established(&self) {
        Self::bump(&self.counters.ike_sa_established);
    }

    /// Track the half-open peak
    pub fn record_half_open(&self, current: u32) {
        self.counters
            .half_open_peak
            .fetch_max(current as u64, Ordering::Relaxed);
    }

    /// Record Child SA registration
    pub fn record_child_sa_created(&self) {
        Self::bump(&self.counters.child_sa_created);
    }

    /// Record Child SA removal
    pub fn record_child_sa_deleted(&self, count: usize) {
        self.counters
            .child_sa_deleted
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record a cookie challenge
    pub fn record_cookie_issued(&self) {
        Self::bump(&self.counters.cookies_issued);
    }

    /// Record a valid returned cookie
    pub fn record_cookie_verified(&self) {
        Self::bump(&self.counters.cookies_verified);
    }

    /// Record a refusal at the half-open limit
    pub fn record_half_open_refused(&self) {
        Self::bump(&self.counters.half_open_refused);
    }

    /// Record a malformed datagram
    pub fn record_parse_failure(&self) {
        Self::bump(&self.counters.parse_failures);
    }

    /// Record a policy failure
    pub fn record_policy_failure(&self) {
        Self::bump(&self.counters.policy_failures);
    }

    /// Record command delivery
    pub fn record_command(&self, delivered: bool) {
        if delivered {
            Self::bump(&self.counters.commands_dispatched);
        } else {
            Self::bump(&self.counters.commands_undeliverable);
        }
    }

    /// Current values
    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        let ike_sa_created = load(&c.ike_sa_created);
        let ike_sa_deleted = load(&c.ike_sa_deleted);
        let child_sa_created = load(&c.child_sa_created);
        let child_sa_deleted = load(&c.child_sa_deleted);

        MetricsSnapshot {
            ike_sa_created,
            ike_sa_deleted,
            ike_sa_active: ike_sa_created.saturating_sub(ike_sa_deleted),
            ike_sa_established: load(&c.ike_sa_established),
            half_open_peak: load(&c.half_open_peak),
            child_sa_created,
            child_sa_deleted,
            child_sa_active: child_sa_created.saturating_sub(child_sa_deleted),
            cookies_issued: load(&c.cookies_issued),
            cookies_verified: load(&c.cookies_verified),
            half_open_refused: load(&c.half_open_refused),
            parse_failures: load(&c.parse_failures),
            policy_failures: load(&c.policy_failures),
            commands_dispatched: load(&c.commands_dispatched),
            commands_undeliverable: load(&c.commands_undeliverable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_counts() {
        let metrics = EngineMetrics::new();
        metrics.record_ike_sa_created();
        metrics.record_ike_sa_created();
        metrics.record_ike_sa_deleted();
        metrics.record_child_sa_created();
        metrics.record_child_sa_created();
        metrics.record_child_sa_deleted(2);

        let snap = metrics.snapshot();
        assert_eq!(snap.ike_sa_active, 1);
        assert_eq!(snap.child_sa_active, 0);
    }

    #[test]
    fn test_half_open_peak_is_max() {
        let metrics = EngineMetrics::new();
        metrics.record_half_open(5);
        metrics.record_half_open(2);
        assert_eq!(metrics.snapshot().half_open_peak, 5);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = EngineMetrics::new();
        let other = metrics.clone();
        other.record_command(true);
        other.record_command(false);

        let snap = metrics.snapshot();
        assert_eq!(snap.commands_dispatched, 1);
        assert_eq!(snap.commands_undeliverable, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(EngineMetrics::new().snapshot()).unwrap();
        assert_eq!(json["cookies_issued"], 0);
    }
}
