//! Group Router (C5): round-robin selection over a group's members.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Holds one atomic counter per group name, created lazily on first pick so
/// that groups discovered later (via C3) get their own counter without a
/// central registration step.
#[derive(Default)]
pub struct GroupRouter {
    counters: Mutex<HashMap<String, Arc<AtomicU64>>>,
}

impl GroupRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, group: &str) -> Arc<AtomicU64> {
        let mut counters = self.counters.lock();
        counters
            .entry(group.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    /// Picks the next member for `group` out of `members`. Increments the
    /// group's counter unconditionally (even for a single-member group) so
    /// the counter stays meaningful for observability. Returns `None` for an
    /// empty member list.
    pub fn pick<'a>(&self, group: &str, members: &'a [String]) -> Option<&'a str> {
        if members.is_empty() {
            return None;
        }
        let counter = self.counter(group);
        // wrapping add: unsigned overflow is defined wrap-around behavior
        let n = counter.fetch_add(1, Ordering::Relaxed);
        let idx = (n % members.len() as u64) as usize;
        Some(members[idx].as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robins_across_members() {
        let router = GroupRouter::new();
        let members = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let picks: Vec<&str> = (0..4)
            .map(|_| router.pick("cluster", &members).unwrap())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn empty_group_returns_none() {
        let router = GroupRouter::new();
        assert_eq!(router.pick("empty", &[]), None);
    }

    #[test]
    fn single_member_always_selected() {
        let router = GroupRouter::new();
        let members = vec!["solo".to_string()];
        for _ in 0..3 {
            assert_eq!(router.pick("one", &members), Some("solo"));
        }
    }

    #[test]
    fn counters_are_independent_per_group() {
        let router = GroupRouter::new();
        let members_a = vec!["a1".to_string(), "a2".to_string()];
        let members_b = vec!["b1".to_string(), "b2".to_string()];
        assert_eq!(router.pick("group-a", &members_a), Some("a1"));
        assert_eq!(router.pick("group-b", &members_b), Some("b1"));
        assert_eq!(router.pick("group-a", &members_a), Some("a2"));
    }

    #[test]
    fn counter_wraps_instead_of_panicking() {
        let router = GroupRouter::new();
        let members = vec!["a".to_string(), "b".to_string()];
        router.counter("wrap").store(u64::MAX, Ordering::Relaxed);
        // fetch_add wraps natively on overflow in release and debug builds
        // alike (unsigned wrapping semantics), so this must not panic.
        let picked = router.pick("wrap", &members);
        assert!(picked.is_some());
    }
}
