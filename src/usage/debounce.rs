//! Change batching for poll cycles.
//!
//! A poll cycle touches every tracked account; consumers want one "state
//! changed" signal per cycle, not one per account. `ChangeBatcher` tracks
//! which accounts the open cycle is still waiting on. The tracker owns the
//! wall-clock deadline and routes its expiry back in with the cycle's
//! generation, so a deadline from a superseded cycle is recognized as stale
//! and ignored.

use super::types::AccountId;
use std::collections::HashSet;

/// Pure bookkeeping for the debounced per-cycle flush.
///
/// At most one cycle is active at a time; starting a new one supersedes the
/// old. Every path that ends a cycle reports `true` exactly once, which is
/// the caller's cue to emit the external signal.
pub struct ChangeBatcher {
    pending: HashSet<AccountId>,
    completed: HashSet<AccountId>,
    generation: u64,
    active: bool,
}

impl ChangeBatcher {
    pub fn new() -> Self {
        Self {
            pending: HashSet::new(),
            completed: HashSet::new(),
            generation: 0,
            active: false,
        }
    }

    /// Starts a new cycle over `ids`, superseding any open cycle.
    ///
    /// Returns the new cycle's generation for deadline arming, or None when
    /// there is nothing to wait on and the caller should flush immediately.
    pub fn begin(&mut self, ids: impl IntoIterator<Item = AccountId>) -> Option<u64> {
        self.generation += 1;
        self.pending = ids.into_iter().collect();
        self.completed.clear();

        if self.pending.is_empty() {
            self.active = false;
            return None;
        }

        self.active = true;
        Some(self.generation)
    }

    /// Records that an account's fetch or local refresh finished.
    ///
    /// Returns true when this completion closed the cycle.
    pub fn mark_complete(&mut self, id: &AccountId) -> bool {
        if !self.active {
            return false;
        }
        self.completed.insert(id.clone());
        self.settle()
    }

    /// Deadline expiry for the cycle with this generation.
    ///
    /// Stale generations (superseded or already flushed cycles) are ignored.
    /// A live one flushes unconditionally so a hung fetch cannot block the
    /// signal forever.
    pub fn expire(&mut self, generation: u64) -> bool {
        if !self.active || generation != self.generation {
            return false;
        }
        self.finish();
        true
    }

    /// Drops an account from the open cycle, as on unregister.
    ///
    /// Returns true when the cycle had been waiting only on this account.
    pub fn remove(&mut self, id: &AccountId) -> bool {
        if !self.active {
            return false;
        }
        self.pending.remove(id);
        self.completed.remove(id);
        self.settle()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    fn settle(&mut self) -> bool {
        let done = self.pending.iter().all(|id| self.completed.contains(id));
        if done {
            self.finish();
        }
        done
    }

    fn finish(&mut self) {
        self.pending.clear();
        self.completed.clear();
        self.active = false;
    }
}

impl Default for ChangeBatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> AccountId {
        AccountId::new(s)
    }

    #[test]
    fn test_begin_empty_flushes_immediately() {
        let mut batcher = ChangeBatcher::new();
        assert_eq!(batcher.begin([]), None);
        assert!(!batcher.is_active());
    }

    #[test]
    fn test_flush_after_all_complete() {
        let mut batcher = ChangeBatcher::new();
        batcher.begin([id("a"), id("b"), id("c")]);

        assert!(!batcher.mark_complete(&id("a")));
        assert!(!batcher.mark_complete(&id("b")));
        assert!(batcher.mark_complete(&id("c")));
        assert!(!batcher.is_active());
    }

    #[test]
    fn test_flush_exactly_once() {
        let mut batcher = ChangeBatcher::new();
        batcher.begin([id("a")]);

        assert!(batcher.mark_complete(&id("a")));
        // Nothing after the flush re-triggers it
        assert!(!batcher.mark_complete(&id("a")));
        assert!(!batcher.expire(1));
    }

    #[test]
    fn test_completion_order_irrelevant() {
        let mut batcher = ChangeBatcher::new();
        batcher.begin([id("a"), id("b")]);

        assert!(!batcher.mark_complete(&id("b")));
        assert!(batcher.mark_complete(&id("a")));
    }

    #[test]
    fn test_duplicate_completion_ignored() {
        let mut batcher = ChangeBatcher::new();
        batcher.begin([id("a"), id("b")]);

        assert!(!batcher.mark_complete(&id("a")));
        assert!(!batcher.mark_complete(&id("a")));
        assert!(batcher.mark_complete(&id("b")));
    }

    #[test]
    fn test_unknown_completion_does_not_close_cycle() {
        let mut batcher = ChangeBatcher::new();
        batcher.begin([id("a")]);

        assert!(!batcher.mark_complete(&id("zombie")));
        assert!(batcher.mark_complete(&id("a")));
    }

    #[test]
    fn test_expire_flushes_live_cycle() {
        let mut batcher = ChangeBatcher::new();
        let generation = batcher.begin([id("a"), id("b")]).unwrap();

        batcher.mark_complete(&id("a"));
        assert!(batcher.expire(generation));
        assert!(!batcher.is_active());
    }

    #[test]
    fn test_expire_stale_generation_ignored() {
        let mut batcher = ChangeBatcher::new();
        let first = batcher.begin([id("a")]).unwrap();
        let second = batcher.begin([id("a"), id("b")]).unwrap();
        assert_ne!(first, second);

        // The superseded cycle's deadline fires late
        assert!(!batcher.expire(first));
        assert!(batcher.is_active());

        assert!(batcher.expire(second));
    }

    #[test]
    fn test_expire_when_idle_ignored() {
        let mut batcher = ChangeBatcher::new();
        assert!(!batcher.expire(0));
        assert!(!batcher.expire(7));
    }

    #[test]
    fn test_new_cycle_supersedes_progress() {
        let mut batcher = ChangeBatcher::new();
        batcher.begin([id("a"), id("b")]);
        batcher.mark_complete(&id("a"));

        // New cycle re-captures both; the old completion no longer counts
        batcher.begin([id("a"), id("b")]);
        assert!(!batcher.mark_complete(&id("b")));
        assert!(batcher.mark_complete(&id("a")));
    }

    #[test]
    fn test_remove_last_pending_flushes() {
        let mut batcher = ChangeBatcher::new();
        batcher.begin([id("a"), id("b")]);

        batcher.mark_complete(&id("a"));
        assert!(batcher.remove(&id("b")));
        assert!(!batcher.is_active());
    }

    #[test]
    fn test_remove_only_account_flushes() {
        let mut batcher = ChangeBatcher::new();
        batcher.begin([id("a")]);
        assert!(batcher.remove(&id("a")));
    }

    #[test]
    fn test_remove_with_others_outstanding() {
        let mut batcher = ChangeBatcher::new();
        batcher.begin([id("a"), id("b"), id("c")]);

        assert!(!batcher.remove(&id("b")));
        batcher.mark_complete(&id("a"));
        assert!(batcher.mark_complete(&id("c")));
    }

    #[test]
    fn test_remove_when_idle_ignored() {
        let mut batcher = ChangeBatcher::new();
        assert!(!batcher.remove(&id("a")));
    }

    #[test]
    fn test_generations_increment_per_cycle() {
        let mut batcher = ChangeBatcher::new();
        let g1 = batcher.begin([id("a")]).unwrap();
        batcher.mark_complete(&id("a"));
        let g2 = batcher.begin([id("a")]).unwrap();
        assert!(g2 > g1);
    }
}
