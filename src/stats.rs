//! Per-thread statistics, mirroring `tdata_t` in the source's
//! `bench_pthreads.c` (op counters) and each variant's own thread-data
//! struct (e.g. `avl_thread_data_t`, the HTM variants' abort counters).
//! These are thread-local until the harness aggregates them with `merge`
//! after all worker threads join (§5, §10.6 of SPEC_FULL.md).

use crate::htm::AbortReason;

/// Per-operation-kind performed/succeeded counters, matching the source's
/// `operations_performed`/`operations_succeeded` arrays indexed by
/// `OPS_LOOKUP`/`OPS_INSERT`/`OPS_DELETE`.
#[derive(Clone, Copy, Default, Debug)]
pub struct OpCounts {
    pub lookup_performed: u64,
    pub lookup_succeeded: u64,
    pub insert_performed: u64,
    pub insert_succeeded: u64,
    pub delete_performed: u64,
    pub delete_succeeded: u64,
}

impl OpCounts {
    pub fn total_performed(&self) -> u64 {
        self.lookup_performed + self.insert_performed + self.delete_performed
    }

    pub fn merge(&self, other: &OpCounts) -> OpCounts {
        OpCounts {
            lookup_performed: self.lookup_performed + other.lookup_performed,
            lookup_succeeded: self.lookup_succeeded + other.lookup_succeeded,
            insert_performed: self.insert_performed + other.insert_performed,
            insert_succeeded: self.insert_succeeded + other.insert_succeeded,
            delete_performed: self.delete_performed + other.delete_performed,
            delete_succeeded: self.delete_succeeded + other.delete_succeeded,
        }
    }
}

/// Transactional retry/abort bookkeeping, shared by the COP (§4.3) and
/// versioned-window HTM (§4.4) variants.
#[derive(Clone, Copy, Default, Debug)]
pub struct AbortStats {
    pub tx_starts: u64,
    pub tx_aborts_conflict: u64,
    pub tx_aborts_non_tx_conflict: u64,
    pub tx_aborts_capacity: u64,
    pub tx_aborts_explicit: u64,
    pub tx_aborts_other: u64,
    pub fallback_lock_acquisitions: u64,
}

impl AbortStats {
    pub fn record_abort(&mut self, reason: AbortReason) {
        match reason {
            AbortReason::Conflict => self.tx_aborts_conflict += 1,
            AbortReason::NonTransactionalConflict => self.tx_aborts_non_tx_conflict += 1,
            AbortReason::Capacity => self.tx_aborts_capacity += 1,
            AbortReason::Explicit(_) => self.tx_aborts_explicit += 1,
            AbortReason::Other => self.tx_aborts_other += 1,
        }
    }

    pub fn total_aborts(&self) -> u64 {
        self.tx_aborts_conflict
            + self.tx_aborts_non_tx_conflict
            + self.tx_aborts_capacity
            + self.tx_aborts_explicit
            + self.tx_aborts_other
    }

    pub fn merge(&self, other: &AbortStats) -> AbortStats {
        AbortStats {
            tx_starts: self.tx_starts + other.tx_starts,
            tx_aborts_conflict: self.tx_aborts_conflict + other.tx_aborts_conflict,
            tx_aborts_non_tx_conflict: self.tx_aborts_non_tx_conflict
                + other.tx_aborts_non_tx_conflict,
            tx_aborts_capacity: self.tx_aborts_capacity + other.tx_aborts_capacity,
            tx_aborts_explicit: self.tx_aborts_explicit + other.tx_aborts_explicit,
            tx_aborts_other: self.tx_aborts_other + other.tx_aborts_other,
            fallback_lock_acquisitions: self.fallback_lock_acquisitions
                + other.fallback_lock_acquisitions,
        }
    }
}

/// Fine-grained-lock bookkeeping (§4.5): total acquisitions and the deepest
/// lock window actually held, which the testable property in SPEC_FULL.md
/// §8 ("no thread holds more than the specified window size") checks against.
#[derive(Clone, Copy, Default, Debug)]
pub struct LockStats {
    pub lock_acquisitions: u64,
    pub max_window_depth_observed: u32,
}

impl LockStats {
    pub fn observe_window(&mut self, depth: u32) {
        self.lock_acquisitions += depth as u64;
        self.max_window_depth_observed = self.max_window_depth_observed.max(depth);
    }

    pub fn merge(&self, other: &LockStats) -> LockStats {
        LockStats {
            lock_acquisitions: self.lock_acquisitions + other.lock_acquisitions,
            max_window_depth_observed: self
                .max_window_depth_observed
                .max(other.max_window_depth_observed),
        }
    }
}

/// Background-maintainer bookkeeping for the relaxed variant (§4.7),
/// reported alongside (not instead of) mutator `OpCounts`.
#[derive(Clone, Copy, Default, Debug)]
pub struct MaintainerStats {
    pub rotations_performed: u64,
    pub nodes_physically_removed: u64,
    pub maintenance_passes: u64,
}

impl MaintainerStats {
    pub fn merge(&self, other: &MaintainerStats) -> MaintainerStats {
        MaintainerStats {
            rotations_performed: self.rotations_performed + other.rotations_performed,
            nodes_physically_removed: self.nodes_physically_removed
                + other.nodes_physically_removed,
            maintenance_passes: self.maintenance_passes + other.maintenance_passes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_stats_classify_and_merge() {
        let mut a = AbortStats::default();
        a.record_abort(AbortReason::Conflict);
        a.record_abort(AbortReason::Capacity);
        assert_eq!(a.total_aborts(), 2);

        let mut b = AbortStats::default();
        b.record_abort(AbortReason::Explicit(crate::htm::GL_TAKEN));
        let merged = a.merge(&b);
        assert_eq!(merged.total_aborts(), 3);
        assert_eq!(merged.tx_aborts_explicit, 1);
    }

    #[test]
    fn lock_stats_tracks_max_window() {
        let mut s = LockStats::default();
        s.observe_window(2);
        s.observe_window(4);
        s.observe_window(3);
        assert_eq!(s.max_window_depth_observed, 4);
        assert_eq!(s.lock_acquisitions, 9);
    }
}
