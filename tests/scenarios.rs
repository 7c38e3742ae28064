//! Black-box scenario tests against the public tree contract (SPEC_FULL.md
//! §8, §10.5): run once per variant via a small table-driven helper, using
//! `crossbeam_utils::thread::scope` for the handful of scenarios that need
//! real concurrent threads, matching the teacher's own concurrent test
//! style (`concurrent_map::tests::smoke`).

use ord_map_bench::map::ConcurrentOrderedMap;
use ord_map_bench::variants::bst_cop_external::BstCopExternal;
use ord_map_bench::variants::cop_external::CopExternal;
use ord_map_bench::variants::fg_spinlock_rbt::FgSpinlockRbt;
use ord_map_bench::variants::htm_window_avl::HtmWindowAvl;
use ord_map_bench::variants::htm_window_tarjan_rbt::HtmWindowTarjanRbt;
use ord_map_bench::variants::relaxed_avl::RelaxedAvl;

/// Scenario 1 + 2 + idempotence laws (§8), run against every variant.
fn empty_then_single_insert<M: ConcurrentOrderedMap>() {
    let tree = M::new(1024);
    let mut td = M::thread_data_new(0);

    assert!(!tree.lookup(&mut td, 42), "{}: empty tree lookup", M::name());
    assert!(!tree.delete(&mut td, 42), "{}: empty tree delete", M::name());

    assert!(tree.insert(&mut td, 5, 500), "{}: first insert", M::name());
    assert!(tree.lookup(&mut td, 5), "{}: lookup after insert", M::name());
    assert!(!tree.lookup(&mut td, 4), "{}: lookup of absent key", M::name());
    assert!(tree.validate(), "{}: validate after single insert", M::name());

    // insert(k); insert(k) -> second call returns false, map unchanged.
    assert!(!tree.insert(&mut td, 5, 999), "{}: duplicate insert", M::name());
    assert!(tree.lookup(&mut td, 5), "{}: still present after dup insert", M::name());

    // insert(k); delete(k) restores prior state.
    assert!(tree.delete(&mut td, 5), "{}: delete present key", M::name());
    assert!(!tree.lookup(&mut td, 5), "{}: absent after delete", M::name());
    // delete(k); delete(k) -> second call returns false, map unchanged.
    assert!(!tree.delete(&mut td, 5), "{}: duplicate delete", M::name());
    assert!(tree.validate(), "{}: validate after delete", M::name());
}

/// Scenario 3 (§8): sequential fill via `warmup`, then validate.
fn sequential_fill<M: ConcurrentOrderedMap>() {
    let tree = M::new(200_000);
    let inserted = tree.warmup(10_000, 20_000, 1, true);
    assert_eq!(inserted, 10_000, "{}: warmup insertion count", M::name());
    assert!(tree.validate(), "{}: validate after warmup", M::name());
}

/// Scenario 5 (§8): monotone insert 1..1000 then monotone delete 1..1000 --
/// the worst case for rotation-based rebalancing -- validating after each
/// batch and expecting an empty, still-valid tree at the end.
fn monotone_insert_then_delete<M: ConcurrentOrderedMap>() {
    let tree = M::new(20_000);
    let mut td = M::thread_data_new(0);

    for k in 1..=1000 {
        assert!(tree.insert(&mut td, k, k as usize), "{}: insert {k}", M::name());
    }
    assert!(tree.validate(), "{}: validate after monotone inserts", M::name());

    for k in 1..=1000 {
        assert!(tree.delete(&mut td, k), "{}: delete {k}", M::name());
    }
    assert!(tree.validate(), "{}: validate after monotone deletes", M::name());

    for k in 1..=1000 {
        assert!(!tree.lookup(&mut td, k), "{}: {k} should be gone", M::name());
    }
}

/// Scenario 4 (§8): a high-contention mixed-op concurrent run; checks that
/// the post-run tree still satisfies its structural invariants. (Observed
/// size accounting and linearizability checking against a recorded op log
/// are exercised by each variant's own unit tests closer to the mechanism;
/// this scenario is the end-to-end structural smoke test the harness relies
/// on before it ever trusts a benchmark number.)
fn high_contention_mix<M: ConcurrentOrderedMap>() {
    let tree = M::new(50_000);
    let inserted = tree.warmup(512, 1024, 1, true);
    assert!(inserted > 0, "{}: warmup should seed some keys", M::name());

    const THREADS: i32 = 8;
    const OPS_PER_THREAD: u32 = 2_000;

    crossbeam_utils::thread::scope(|scope| {
        for tid in 0..THREADS {
            let tree = &tree;
            scope.spawn(move |_| {
                let mut td = M::thread_data_new(tid);
                let mut state = (tid as u64 + 1).wrapping_mul(0x9E3779B97F4A7C15);
                for _ in 0..OPS_PER_THREAD {
                    // xorshift64 -- no external RNG dependency needed for a
                    // deterministic-enough key/op stream inside a test.
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    let key = (state % 1024) as i32;
                    match state % 10 {
                        0..=7 => {
                            tree.lookup(&mut td, key);
                        }
                        8 => {
                            tree.insert(&mut td, key, key as usize);
                        }
                        _ => {
                            tree.delete(&mut td, key);
                        }
                    }
                }
            });
        }
    })
    .unwrap();

    assert!(tree.validate(), "{}: validate after contended mix", M::name());
}

macro_rules! scenario_suite {
    ($name:ident, $ty:ty) => {
        mod $name {
            use super::*;

            #[test]
            fn empty_then_single_insert() {
                super::empty_then_single_insert::<$ty>();
            }

            #[test]
            fn sequential_fill() {
                super::sequential_fill::<$ty>();
            }

            #[test]
            fn monotone_insert_then_delete() {
                super::monotone_insert_then_delete::<$ty>();
            }

            #[test]
            fn high_contention_mix() {
                super::high_contention_mix::<$ty>();
            }
        }
    };
}

scenario_suite!(bst_cop_external, BstCopExternal);
scenario_suite!(rbt_links_bu_ext_cop, CopExternal);
scenario_suite!(rbt_links_td_ext_fg_spinlock, FgSpinlockRbt);
scenario_suite!(avl_links_bu_ext_fg_htm, HtmWindowAvl);
scenario_suite!(rbt_links_td_tarjan_ext_fg_htm, HtmWindowTarjanRbt);

/// The relaxed variant is exercised separately: `validate()` is only
/// meaningful once the background maintainer has drained (SPEC_FULL.md
/// §4.7), so its scenario suite runs `maintenance_pass` to completion
/// before checking invariants instead of relying on mutators alone.
mod avl_contention_friendly {
    use super::*;

    fn drain(tree: &RelaxedAvl) {
        let mut stats = Default::default();
        for _ in 0..64 {
            tree.maintenance_pass(&mut stats);
        }
    }

    #[test]
    fn empty_then_single_insert() {
        let tree = RelaxedAvl::new(1024);
        let mut td = RelaxedAvl::thread_data_new(0);

        assert!(!tree.lookup(&mut td, 42));
        assert!(!tree.delete(&mut td, 42));

        assert!(tree.insert(&mut td, 5, 500));
        assert!(tree.lookup(&mut td, 5));
        assert!(!tree.lookup(&mut td, 4));
        drain(&tree);
        assert!(tree.validate());

        assert!(!tree.insert(&mut td, 5, 999));
        assert!(tree.delete(&mut td, 5));
        assert!(!tree.lookup(&mut td, 5));
        assert!(!tree.delete(&mut td, 5));
        drain(&tree);
        assert!(tree.validate());
    }

    #[test]
    fn sequential_fill() {
        let tree = RelaxedAvl::new(200_000);
        let inserted = tree.warmup(10_000, 20_000, 1, true);
        assert_eq!(inserted, 10_000);
        drain(&tree);
        assert!(tree.validate());
    }

    #[test]
    fn monotone_insert_then_delete() {
        let tree = RelaxedAvl::new(20_000);
        let mut td = RelaxedAvl::thread_data_new(0);

        for k in 1..=1000 {
            assert!(tree.insert(&mut td, k, k as usize));
        }
        drain(&tree);
        assert!(tree.validate());

        for k in 1..=1000 {
            assert!(tree.delete(&mut td, k));
        }
        drain(&tree);
        assert!(tree.validate());
        for k in 1..=1000 {
            assert!(!tree.lookup(&mut td, k));
        }
    }

    #[test]
    fn high_contention_mix() {
        let tree = RelaxedAvl::new(50_000);
        let inserted = tree.warmup(512, 1024, 1, true);
        assert!(inserted > 0);

        const THREADS: i32 = 8;
        const OPS_PER_THREAD: u32 = 2_000;
        let stop = std::sync::atomic::AtomicBool::new(false);

        crossbeam_utils::thread::scope(|scope| {
            let maintainer = scope.spawn(|_| {
                let mut stats = Default::default();
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    tree.maintenance_pass(&mut stats);
                }
            });

            let workers: Vec<_> = (0..THREADS)
                .map(|tid| {
                    let tree = &tree;
                    scope.spawn(move |_| {
                        let mut td = RelaxedAvl::thread_data_new(tid);
                        let mut state = (tid as u64 + 1).wrapping_mul(0x9E3779B97F4A7C15);
                        for _ in 0..OPS_PER_THREAD {
                            state ^= state << 13;
                            state ^= state >> 7;
                            state ^= state << 17;
                            let key = (state % 1024) as i32;
                            match state % 10 {
                                0..=7 => {
                                    tree.lookup(&mut td, key);
                                }
                                8 => {
                                    tree.insert(&mut td, key, key as usize);
                                }
                                _ => {
                                    tree.delete(&mut td, key);
                                }
                            }
                        }
                    })
                })
                .collect();

            for w in workers {
                w.join().unwrap();
            }
            stop.store(true, std::sync::atomic::Ordering::Relaxed);
            maintainer.join().unwrap();
        })
        .unwrap();

        drain(&tree);
        assert!(tree.validate());
    }
}
