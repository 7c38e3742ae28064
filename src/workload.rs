//! Workload generation and execution (SPEC_FULL.md §6 harness contract,
//! §10.4 CLI/harness binary): turns a `Config`'s operation-mix fractions and
//! workload selector into a per-thread random operation stream driven
//! against any [`ConcurrentOrderedMap`], mirroring `thread_loop` in the
//! source's `bench_pthreads.c`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

use crate::map::ConcurrentOrderedMap;

/// `WORKLOAD_FIXED` / `WORKLOAD_TIME` from the harness contract (SPEC_FULL.md §6).
#[derive(Clone, Copy, Debug)]
pub enum WorkloadMode {
    /// Run until this thread has performed `ops` operations.
    Fixed { ops: u64 },
    /// Run until `run_time` has elapsed, checked every
    /// [`TIME_CHECK_INTERVAL_OPS`] operations so the timer syscall stays off
    /// the hot path.
    Time { run_time: Duration },
}

/// Operation-mix fractions plus the key universe, everything `step` needs
/// to draw one random operation (SPEC_FULL.md §6's `lookup_frac` /
/// `insert_frac` / `delete_frac` / `max_key`).
#[derive(Clone, Copy, Debug)]
pub struct OpMix {
    pub lookup_frac: u8,
    pub insert_frac: u8,
    pub delete_frac: u8,
    pub max_key: i32,
}

impl OpMix {
    pub fn new(lookup_frac: u8, insert_frac: u8, delete_frac: u8, max_key: i32) -> Self {
        OpMix {
            lookup_frac,
            insert_frac,
            delete_frac,
            max_key,
        }
    }

    fn pick(&self, rng: &mut StdRng) -> OpKind {
        let r = rng.gen_range(0..100u32);
        if r < self.lookup_frac as u32 {
            OpKind::Lookup
        } else if r < self.lookup_frac as u32 + self.insert_frac as u32 {
            OpKind::Insert
        } else {
            OpKind::Delete
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OpKind {
    Lookup,
    Insert,
    Delete,
}

/// How many operations a `Time`-mode worker performs between wall-clock
/// checks. Large enough that `Instant::now()` doesn't dominate, small
/// enough that a run doesn't overshoot its deadline by much.
pub const TIME_CHECK_INTERVAL_OPS: u64 = 64;

/// Runs one worker thread's share of the workload against `map`, recording
/// statistics into `td`. Returns the number of operations actually
/// performed. Mirrors `thread_loop` in the source: draw a uniform key in
/// `[0, max_key)`, draw an operation kind from the configured mix, dispatch.
pub fn run_worker<M: ConcurrentOrderedMap>(
    map: &M,
    td: &mut M::Td,
    mix: &OpMix,
    mode: WorkloadMode,
    seed: u64,
) -> u64 {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut done = 0u64;
    match mode {
        WorkloadMode::Fixed { ops } => {
            while done < ops {
                step(map, td, mix, &mut rng);
                done += 1;
            }
        }
        WorkloadMode::Time { run_time } => {
            let start = Instant::now();
            'outer: loop {
                for _ in 0..TIME_CHECK_INTERVAL_OPS {
                    step(map, td, mix, &mut rng);
                    done += 1;
                }
                if start.elapsed() >= run_time {
                    break 'outer;
                }
            }
        }
    }
    done
}

fn step<M: ConcurrentOrderedMap>(map: &M, td: &mut M::Td, mix: &OpMix, rng: &mut StdRng) {
    let key = rng.gen_range(0..mix.max_key);
    match mix.pick(rng) {
        OpKind::Lookup => {
            map.lookup(td, key);
        }
        OpKind::Insert => {
            map.insert(td, key, key as usize);
        }
        OpKind::Delete => {
            map.delete(td, key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::ThreadData;
    use std::sync::Mutex;
    use std::collections::BTreeSet;

    struct TinyMap(Mutex<BTreeSet<i32>>);
    struct Td;
    impl ThreadData for Td {
        fn new(_tid: i32) -> Self {
            Td
        }
        fn print(&self, _out: &mut dyn std::fmt::Write) {}
        fn merge(&self, _other: &Self) -> Self {
            Td
        }
    }
    impl ConcurrentOrderedMap for TinyMap {
        type Td = Td;
        fn new(_capacity: usize) -> Self {
            TinyMap(Mutex::new(BTreeSet::new()))
        }
        fn name() -> &'static str {
            "tiny-map-for-workload-tests"
        }
        fn lookup(&self, _td: &mut Self::Td, key: i32) -> bool {
            self.0.lock().unwrap().contains(&key)
        }
        fn insert(&self, _td: &mut Self::Td, key: i32, _value: usize) -> bool {
            self.0.lock().unwrap().insert(key)
        }
        fn delete(&self, _td: &mut Self::Td, key: i32) -> bool {
            self.0.lock().unwrap().remove(&key)
        }
        fn validate(&self) -> bool {
            true
        }
    }

    #[test]
    fn fixed_mode_runs_exactly_the_requested_op_count() {
        let map = TinyMap::new(16);
        let mut td = Td;
        let mix = OpMix::new(80, 10, 10, 100);
        let done = run_worker(&map, &mut td, &mix, WorkloadMode::Fixed { ops: 500 }, 42);
        assert_eq!(done, 500);
    }

    #[test]
    fn time_mode_stops_near_the_deadline() {
        let map = TinyMap::new(16);
        let mut td = Td;
        let mix = OpMix::new(80, 10, 10, 100);
        let start = Instant::now();
        let done = run_worker(
            &map,
            &mut td,
            &mix,
            WorkloadMode::Time {
                run_time: Duration::from_millis(20),
            },
            7,
        );
        assert!(done > 0);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn pick_respects_lookup_heavy_mix_distribution() {
        let mix = OpMix::new(100, 0, 0, 10);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..1000 {
            assert_eq!(mix.pick(&mut rng), OpKind::Lookup);
        }
    }
}
