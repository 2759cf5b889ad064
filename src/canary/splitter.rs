//! Sticky traffic splitting.
//!
//! An identifier is hashed with SHA-256 (stable across processes and
//! releases, unlike `DefaultHasher`) into a bucket in `[0, 100)`; the
//! request goes to the new provider iff its bucket is below the configured
//! percentage. The same identifier therefore lands on the same side for a
//! fixed percentage, and raising the percentage only ever moves buckets
//! from legacy to new.

use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::state::RolloutState;

/// Stable bucket of `id` in `[0, 100)`.
pub fn bucket(id: &str) -> u8 {
    let digest = Sha256::digest(id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    // < 100, fits in u8
    (u64::from_be_bytes(head) % 100) as u8
}

/// Deterministic new-vs-legacy decision for one identifier.
pub fn should_use_new_provider(id: &str, percentage: u8) -> bool {
    bucket(id) < percentage.min(100)
}

/// Splitter bound to the live rollout percentage.
#[derive(Clone)]
pub struct TrafficSplitter {
    state: Arc<dyn RolloutState>,
}

impl std::fmt::Debug for TrafficSplitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrafficSplitter")
            .field("percentage", &self.state.percentage())
            .finish()
    }
}

impl TrafficSplitter {
    /// Splitter reading its percentage from `state` on every call.
    pub fn new(state: Arc<dyn RolloutState>) -> Self {
        Self { state }
    }

    /// Whether `id` goes to the new provider at the current percentage.
    pub fn should_use_new_provider(&self, id: &str) -> bool {
        should_use_new_provider(id, self.state.percentage())
    }

    /// Current percentage.
    pub fn percentage(&self) -> u8 {
        self.state.percentage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canary::state::FixedRollout;

    #[test]
    fn test_zero_percent_never_routes_new() {
        assert!((0..500).all(|i| !should_use_new_provider(&format!("id-{i}"), 0)));
    }

    #[test]
    fn test_hundred_percent_always_routes_new() {
        assert!((0..500).all(|i| should_use_new_provider(&format!("id-{i}"), 100)));
    }

    #[test]
    fn test_bucket_is_stable() {
        assert_eq!(bucket("user-42"), bucket("user-42"));
        assert!(bucket("user-42") < 100);
    }

    #[test]
    fn test_raising_percentage_only_adds_ids() {
        for i in 0..1000 {
            let id = format!("u{i}");
            if should_use_new_provider(&id, 10) {
                assert!(should_use_new_provider(&id, 50));
            }
        }
    }

    #[test]
    fn test_distribution_close_to_percentage() {
        let n = 10_000;
        let hits = (0..n)
            .filter(|i| should_use_new_provider(&format!("request-{i}"), 30))
            .count();
        let fraction = hits as f64 / n as f64;
        assert!((fraction - 0.30).abs() < 0.05, "fraction {fraction}");
    }

    #[test]
    fn test_splitter_reads_state() {
        let splitter = TrafficSplitter::new(Arc::new(FixedRollout(100)));
        assert!(splitter.should_use_new_provider("anyone"));
        assert_eq!(splitter.percentage(), 100);
    }
}
