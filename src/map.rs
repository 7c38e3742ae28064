//! The tree contract every variant implements (SPEC_FULL.md §6): a uniform
//! `lookup/insert/delete/validate/warmup/name` surface the harness drives
//! without knowing which concurrency scheme sits behind it.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::stats::OpCounts;

/// Per-thread scratch space and counters. Each variant defines its own
/// concrete type (abort counters for the transactional variants, lock
/// counters for the spinlock variant, ...); the harness only needs to
/// create, print and merge them.
pub trait ThreadData: Send {
    fn new(tid: i32) -> Self;
    fn print(&self, out: &mut dyn std::fmt::Write);
    fn merge(&self, other: &Self) -> Self;

    /// Raw lookup/insert/delete performed/succeeded counters, so the
    /// harness can report the source's "Expected size of RBT" line
    /// (`init_tree_size + successful_inserts - successful_deletes`, see
    /// `bench_pthreads.c`) without needing to know each variant's own
    /// `Td` layout. Defaults to all zeros for test fixtures that don't
    /// track operation counts at all.
    fn op_counts(&self) -> OpCounts {
        OpCounts::default()
    }
}

/// A concurrent ordered map keyed by `i32`, carrying an opaque
/// pointer-sized payload (SPEC_FULL.md §3 -- the tree never interprets
/// `value`).
pub trait ConcurrentOrderedMap: Send + Sync {
    type Td: ThreadData;

    fn new(capacity: usize) -> Self
    where
        Self: Sized;

    fn name() -> &'static str
    where
        Self: Sized;

    fn thread_data_new(tid: i32) -> Self::Td {
        Self::Td::new(tid)
    }

    fn lookup(&self, td: &mut Self::Td, key: i32) -> bool;
    fn insert(&self, td: &mut Self::Td, key: i32, value: usize) -> bool;
    fn delete(&self, td: &mut Self::Td, key: i32) -> bool;

    /// Checked sequentially, after all workers have stopped (and, for the
    /// relaxed variant, after the maintainer has drained).
    fn validate(&self) -> bool;

    /// Single-threaded population of the tree before the timed phase.
    /// Returns the number of keys actually inserted (duplicates skipped).
    fn warmup(&self, n: usize, max_key: i32, seed: u64, force: bool) -> usize {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut td = Self::thread_data_new(-1);
        let mut inserted = 0usize;
        let mut attempts = 0usize;
        // `force` keeps retrying colliding keys until `n` distinct keys
        // have actually landed, matching the source's warmup helpers which
        // guarantee the requested initial size rather than "best effort".
        while inserted < n && (force || attempts < n) {
            let key: i32 = rng.gen_range(0..max_key);
            if self.insert(&mut td, key, key as usize) {
                inserted += 1;
            }
            attempts += 1;
            if !force && attempts >= n.saturating_mul(4) {
                break;
            }
        }
        inserted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullTd;
    impl ThreadData for NullTd {
        fn new(_tid: i32) -> Self {
            NullTd
        }
        fn print(&self, _out: &mut dyn std::fmt::Write) {}
        fn merge(&self, _other: &Self) -> Self {
            NullTd
        }
    }

    struct TinyMap {
        keys: std::sync::Mutex<std::collections::BTreeSet<i32>>,
    }

    impl ConcurrentOrderedMap for TinyMap {
        type Td = NullTd;

        fn new(_capacity: usize) -> Self {
            TinyMap {
                keys: std::sync::Mutex::new(std::collections::BTreeSet::new()),
            }
        }

        fn name() -> &'static str {
            "tiny-map-for-tests"
        }

        fn lookup(&self, _td: &mut Self::Td, key: i32) -> bool {
            self.keys.lock().unwrap().contains(&key)
        }

        fn insert(&self, _td: &mut Self::Td, key: i32, _value: usize) -> bool {
            self.keys.lock().unwrap().insert(key)
        }

        fn delete(&self, _td: &mut Self::Td, key: i32) -> bool {
            self.keys.lock().unwrap().remove(&key)
        }

        fn validate(&self) -> bool {
            true
        }
    }

    #[test]
    fn default_warmup_inserts_requested_distinct_keys() {
        let map = TinyMap::new(16);
        let inserted = map.warmup(50, 1000, 7, true);
        assert_eq!(inserted, 50);
        assert_eq!(map.keys.lock().unwrap().len(), 50);
    }
}
